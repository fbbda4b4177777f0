// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Per-operation contexts handed to archivers and restorers.
//!
//! A context lives for exactly one export or import and is scoped to that
//! operation's transaction. The pipelines build it, pass it by reference to
//! every archiver, and drop it when the operation ends.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
};

use rusqlite::Connection;
use serde::Serialize;
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    accounting::AttachmentByteCounter, bench::Bencher, crypto::MediaRootBackupKey,
    filter::IncludedContentFilter,
};

/// Stable account identifier (the service id of the local account).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.0)
    }
}

/// Identifiers of the local account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentifiers {
    pub aci: AccountId,
    pub e164: Option<String>,
}

impl LocalIdentifiers {
    pub fn new(aci: impl Into<String>, e164: Option<&str>) -> Self {
        Self {
            aci: AccountId::new(aci),
            e164: e164.map(str::to_string),
        }
    }
}

/// Why an archive is being produced or consumed. Selects the key derivation and
/// the content filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum BackupPurpose {
    /// Direct device-to-device migration with a one-time key.
    DeviceTransfer,
    /// Backup uploaded to the server, keyed through the secret recovery service.
    RemoteBackup,
}

/// Recipient id inside an archive. Assigned at export time; only meaningful
/// within one archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecipientId(pub u64);

/// Chat id inside an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(pub u64);

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind of a restored recipient row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RecipientKind {
    Contact,
    Group,
    DistributionList,
    SelfRecipient,
    ReleaseNotes,
    CallLink,
}

/// A restored recipient: local row id plus kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoredRecipient {
    pub row_id: i64,
    pub kind: RecipientKind,
}

/// Work that can only run once every frame has been read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostFrameRestoreAction {
    /// Recompute the last visible message of a thread.
    UpdateChatLastMessage { thread_row: i64 },
    /// Link a distribution list to its members, which may appear later in the stream.
    ResolveDistributionListMembers {
        list_row: i64,
        members: Vec<RecipientId>,
    },
}

// ============================================================================
// Export
// ============================================================================

/// State shared by every archiver during one export.
pub struct ArchivingContext<'a> {
    pub conn: &'a Connection,
    pub local: &'a LocalIdentifiers,
    pub purpose: BackupPurpose,
    pub start_timestamp_ms: u64,
    pub upload_era: String,
    pub filter: IncludedContentFilter,
    pub byte_counter: &'a AttachmentByteCounter,
    pub bencher: &'a Bencher,
    next_recipient_id: Cell<u64>,
    next_chat_id: Cell<u64>,
    local_recipient: Cell<Option<RecipientId>>,
    recipients: RefCell<HashMap<i64, RecipientId>>,
    chats: RefCell<HashMap<i64, ChatId>>,
}

impl<'a> ArchivingContext<'a> {
    pub fn new(
        conn: &'a Connection,
        local: &'a LocalIdentifiers,
        purpose: BackupPurpose,
        start_timestamp_ms: u64,
        upload_era: String,
        byte_counter: &'a AttachmentByteCounter,
        bencher: &'a Bencher,
    ) -> Self {
        Self {
            conn,
            local,
            purpose,
            start_timestamp_ms,
            upload_era,
            filter: IncludedContentFilter::for_purpose(purpose),
            byte_counter,
            bencher,
            next_recipient_id: Cell::new(1),
            next_chat_id: Cell::new(1),
            local_recipient: Cell::new(None),
            recipients: RefCell::new(HashMap::new()),
            chats: RefCell::new(HashMap::new()),
        }
    }

    /// Assign (or look up) the archive id of a local recipient row.
    pub fn assign_recipient_id(&self, row_id: i64) -> RecipientId {
        let mut recipients = self.recipients.borrow_mut();
        *recipients.entry(row_id).or_insert_with(|| {
            let id = self.next_recipient_id.get();
            self.next_recipient_id.set(id + 1);
            RecipientId(id)
        })
    }

    pub fn recipient_id(&self, row_id: i64) -> Option<RecipientId> {
        self.recipients.borrow().get(&row_id).copied()
    }

    pub fn set_local_recipient(&self, id: RecipientId) {
        self.local_recipient.set(Some(id));
    }

    /// Archive id of the local account's own recipient, once archived.
    pub fn local_recipient(&self) -> Option<RecipientId> {
        self.local_recipient.get()
    }

    pub fn assign_chat_id(&self, thread_row: i64) -> ChatId {
        let mut chats = self.chats.borrow_mut();
        *chats.entry(thread_row).or_insert_with(|| {
            let id = self.next_chat_id.get();
            self.next_chat_id.set(id + 1);
            ChatId(id)
        })
    }

    pub fn chat_id(&self, thread_row: i64) -> Option<ChatId> {
        self.chats.borrow().get(&thread_row).copied()
    }
}

impl fmt::Debug for ArchivingContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchivingContext")
            .field("purpose", &self.purpose)
            .field("start_timestamp_ms", &self.start_timestamp_ms)
            .field("upload_era", &self.upload_era)
            .field("recipients", &self.recipients.borrow().len())
            .field("chats", &self.chats.borrow().len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Import
// ============================================================================

/// State shared by every restorer during one import.
pub struct RestoringContext<'a> {
    pub conn: &'a Connection,
    pub local: &'a LocalIdentifiers,
    pub purpose: BackupPurpose,
    pub start_timestamp_ms: u64,
    pub backup_time_ms: u64,
    pub media_root_backup_key: MediaRootBackupKey,
    pub bencher: &'a Bencher,
    recipients: RefCell<HashMap<RecipientId, RestoredRecipient>>,
    chats: RefCell<HashMap<ChatId, i64>>,
    post_frame_actions: RefCell<Vec<PostFrameRestoreAction>>,
}

impl<'a> RestoringContext<'a> {
    pub fn new(
        conn: &'a Connection,
        local: &'a LocalIdentifiers,
        purpose: BackupPurpose,
        start_timestamp_ms: u64,
        backup_time_ms: u64,
        media_root_backup_key: MediaRootBackupKey,
        bencher: &'a Bencher,
    ) -> Self {
        Self {
            conn,
            local,
            purpose,
            start_timestamp_ms,
            backup_time_ms,
            media_root_backup_key,
            bencher,
            recipients: RefCell::new(HashMap::new()),
            chats: RefCell::new(HashMap::new()),
            post_frame_actions: RefCell::new(Vec::new()),
        }
    }

    pub fn map_recipient(&self, id: RecipientId, row_id: i64, kind: RecipientKind) {
        self.recipients
            .borrow_mut()
            .insert(id, RestoredRecipient { row_id, kind });
    }

    pub fn recipient(&self, id: RecipientId) -> Option<RestoredRecipient> {
        self.recipients.borrow().get(&id).copied()
    }

    pub fn map_chat(&self, id: ChatId, thread_row: i64) {
        self.chats.borrow_mut().insert(id, thread_row);
    }

    pub fn chat(&self, id: ChatId) -> Option<i64> {
        self.chats.borrow().get(&id).copied()
    }

    /// Queue an action for after the frame loop. Identical actions are queued once.
    pub fn enqueue_post_frame_action(&self, action: PostFrameRestoreAction) {
        let mut actions = self.post_frame_actions.borrow_mut();
        if !actions.contains(&action) {
            actions.push(action);
        }
    }

    /// Drain the queued actions in insertion order.
    pub fn take_post_frame_actions(&self) -> Vec<PostFrameRestoreAction> {
        std::mem::take(&mut *self.post_frame_actions.borrow_mut())
    }
}

impl fmt::Debug for RestoringContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoringContext")
            .field("purpose", &self.purpose)
            .field("backup_time_ms", &self.backup_time_ms)
            .field("recipients", &self.recipients.borrow().len())
            .field("chats", &self.chats.borrow().len())
            .field("post_frame_actions", &self.post_frame_actions.borrow().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_ids_are_stable_and_dense() {
        let conn = Connection::open_in_memory().expect("db");
        let local = LocalIdentifiers::new("acct", None);
        let counter = AttachmentByteCounter::default();
        let bencher = Bencher::new();
        let ctx = ArchivingContext::new(
            &conn,
            &local,
            BackupPurpose::RemoteBackup,
            0,
            "era".into(),
            &counter,
            &bencher,
        );
        assert_eq!(ctx.assign_recipient_id(40), RecipientId(1));
        assert_eq!(ctx.assign_recipient_id(7), RecipientId(2));
        assert_eq!(ctx.assign_recipient_id(40), RecipientId(1));
        assert_eq!(ctx.recipient_id(7), Some(RecipientId(2)));
        assert_eq!(ctx.recipient_id(8), None);
    }

    #[test]
    fn post_frame_actions_dedupe_in_order() {
        let conn = Connection::open_in_memory().expect("db");
        let local = LocalIdentifiers::new("acct", None);
        let bencher = Bencher::new();
        let ctx = RestoringContext::new(
            &conn,
            &local,
            BackupPurpose::DeviceTransfer,
            0,
            0,
            MediaRootBackupKey::generate(),
            &bencher,
        );
        ctx.enqueue_post_frame_action(PostFrameRestoreAction::UpdateChatLastMessage { thread_row: 2 });
        ctx.enqueue_post_frame_action(PostFrameRestoreAction::UpdateChatLastMessage { thread_row: 1 });
        ctx.enqueue_post_frame_action(PostFrameRestoreAction::UpdateChatLastMessage { thread_row: 2 });
        assert_eq!(
            ctx.take_post_frame_actions(),
            vec![
                PostFrameRestoreAction::UpdateChatLastMessage { thread_row: 2 },
                PostFrameRestoreAction::UpdateChatLastMessage { thread_row: 1 },
            ]
        );
        assert!(ctx.take_post_frame_actions().is_empty());
    }
}

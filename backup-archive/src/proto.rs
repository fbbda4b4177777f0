// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Frame schema.
//!
//! Each archive holds one length-delimited [`BackupInfo`] followed by any number of
//! length-delimited [`Frame`]s. The per-entity records carry only the fields the
//! reference store round-trips; unknown fields are ignored by the decoder.

use serde::Serialize;
use strum::{Display, EnumIter, IntoStaticStr};

/// First record of every archive.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BackupInfo {
    #[prost(uint64, tag = "1")]
    pub version: u64,
    /// Creation time, ms since epoch
    #[prost(uint64, tag = "2")]
    pub backup_time_ms: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub media_root_backup_key: Vec<u8>,
    #[prost(string, tag = "4")]
    pub current_app_version: String,
    #[prost(string, tag = "5")]
    pub first_app_version: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    #[prost(oneof = "frame::Item", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
    pub item: Option<frame::Item>,
}

pub mod frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Item {
        #[prost(message, tag = "1")]
        Account(super::AccountData),
        #[prost(message, tag = "2")]
        Recipient(super::Recipient),
        #[prost(message, tag = "3")]
        Chat(super::Chat),
        #[prost(message, tag = "4")]
        ChatItem(super::ChatItem),
        #[prost(message, tag = "5")]
        StickerPack(super::StickerPack),
        #[prost(message, tag = "6")]
        AdHocCall(super::AdHocCall),
        #[prost(message, tag = "7")]
        NotificationProfile(super::NotificationProfile),
        #[prost(message, tag = "8")]
        ChatFolder(super::ChatFolder),
    }
}

impl Frame {
    pub fn new(item: frame::Item) -> Self {
        Self { item: Some(item) }
    }

    pub fn kind(&self) -> FrameKind {
        FrameKind::of(self.item.as_ref())
    }
}

/// Record kind of a frame, used for benchmarks and log fields.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter, IntoStaticStr, Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    AccountData,
    Recipient,
    Chat,
    ChatItem,
    StickerPack,
    AdHocCall,
    NotificationProfile,
    ChatFolder,
    Unknown,
}

impl FrameKind {
    pub fn of(item: Option<&frame::Item>) -> Self {
        match item {
            Some(frame::Item::Account(_)) => Self::AccountData,
            Some(frame::Item::Recipient(_)) => Self::Recipient,
            Some(frame::Item::Chat(_)) => Self::Chat,
            Some(frame::Item::ChatItem(_)) => Self::ChatItem,
            Some(frame::Item::StickerPack(_)) => Self::StickerPack,
            Some(frame::Item::AdHocCall(_)) => Self::AdHocCall,
            Some(frame::Item::NotificationProfile(_)) => Self::NotificationProfile,
            Some(frame::Item::ChatFolder(_)) => Self::ChatFolder,
            None => Self::Unknown,
        }
    }
}

// ----------------------------------------------------------------------------
// Account
// ----------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AccountData {
    #[prost(bytes = "vec", tag = "1")]
    pub profile_key: Vec<u8>,
    #[prost(string, optional, tag = "2")]
    pub username: Option<String>,
    #[prost(string, tag = "3")]
    pub given_name: String,
    #[prost(string, tag = "4")]
    pub family_name: String,
    #[prost(message, optional, tag = "5")]
    pub account_settings: Option<AccountSettings>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AccountSettings {
    #[prost(bool, tag = "1")]
    pub read_receipts: bool,
    #[prost(bool, tag = "2")]
    pub typing_indicators: bool,
    #[prost(uint32, tag = "3")]
    pub universal_expire_timer_seconds: u32,
    #[prost(bool, tag = "4")]
    pub display_badges_on_profile: bool,
}

// ----------------------------------------------------------------------------
// Recipients
// ----------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Recipient {
    /// Archive-scoped id, referenced by chats, chat items and calls.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(oneof = "recipient::Destination", tags = "2, 3, 4, 5, 6, 7")]
    pub destination: Option<recipient::Destination>,
}

pub mod recipient {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Destination {
        #[prost(message, tag = "2")]
        Contact(super::Contact),
        #[prost(message, tag = "3")]
        Group(super::Group),
        #[prost(message, tag = "4")]
        DistributionList(super::DistributionListItem),
        #[prost(message, tag = "5")]
        SelfRecipient(super::SelfRecipient),
        #[prost(message, tag = "6")]
        ReleaseNotes(super::ReleaseNotes),
        #[prost(message, tag = "7")]
        CallLink(super::CallLink),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Contact {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub aci: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "2")]
    pub e164: Option<u64>,
    #[prost(string, optional, tag = "3")]
    pub profile_given_name: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub profile_family_name: Option<String>,
    #[prost(bool, tag = "5")]
    pub blocked: bool,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub profile_key: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Group {
    #[prost(bytes = "vec", tag = "1")]
    pub master_key: Vec<u8>,
    #[prost(string, tag = "2")]
    pub title: String,
    #[prost(bool, tag = "3")]
    pub whitelisted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DistributionListItem {
    #[prost(bytes = "vec", tag = "1")]
    pub distribution_id: Vec<u8>,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(uint64, repeated, tag = "3")]
    pub member_recipient_ids: Vec<u64>,
    #[prost(uint64, optional, tag = "4")]
    pub deletion_timestamp: Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SelfRecipient {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReleaseNotes {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallLink {
    #[prost(bytes = "vec", tag = "1")]
    pub root_key: Vec<u8>,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(uint64, tag = "3")]
    pub expiration_ms: u64,
}

// ----------------------------------------------------------------------------
// Chats and messages
// ----------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Chat {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub recipient_id: u64,
    #[prost(bool, tag = "3")]
    pub archived: bool,
    #[prost(uint32, optional, tag = "4")]
    pub pinned_order: Option<u32>,
    #[prost(uint64, tag = "5")]
    pub expiration_timer_ms: u64,
    #[prost(uint64, optional, tag = "6")]
    pub mute_until_ms: Option<u64>,
    #[prost(bool, tag = "7")]
    pub mark_unread: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Direction {
    Unknown = 0,
    Incoming = 1,
    Outgoing = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatItem {
    #[prost(uint64, tag = "1")]
    pub chat_id: u64,
    #[prost(uint64, tag = "2")]
    pub author_id: u64,
    #[prost(uint64, tag = "3")]
    pub date_sent: u64,
    #[prost(uint64, optional, tag = "4")]
    pub expire_start_date: Option<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub expires_in_ms: Option<u64>,
    #[prost(enumeration = "Direction", tag = "6")]
    pub direction: i32,
    #[prost(oneof = "chat_item::Item", tags = "7, 8")]
    pub item: Option<chat_item::Item>,
}

pub mod chat_item {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Item {
        #[prost(message, tag = "7")]
        StandardMessage(super::StandardMessage),
        #[prost(message, tag = "8")]
        ViewOnceMessage(super::ViewOnceMessage),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StandardMessage {
    #[prost(message, optional, tag = "1")]
    pub text: Option<Text>,
    #[prost(message, repeated, tag = "2")]
    pub attachments: Vec<MessageAttachment>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Text {
    #[prost(string, tag = "1")]
    pub body: String,
}

/// View-once content. `attachment` is absent once viewed, and in remote backups
/// where unviewed content is tombstoned.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ViewOnceMessage {
    #[prost(message, optional, tag = "1")]
    pub attachment: Option<MessageAttachment>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageAttachment {
    #[prost(message, optional, tag = "1")]
    pub pointer: Option<FilePointer>,
    #[prost(bool, tag = "2")]
    pub was_downloaded: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FilePointer {
    /// Content-addressed name in the media tier; identifies the attachment.
    #[prost(string, tag = "1")]
    pub media_name: String,
    #[prost(uint64, tag = "2")]
    pub size: u64,
    #[prost(string, tag = "3")]
    pub content_type: String,
    #[prost(bytes = "vec", tag = "4")]
    pub digest: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Other records
// ----------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StickerPack {
    #[prost(bytes = "vec", tag = "1")]
    pub pack_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub pack_key: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AdHocCallState {
    UnknownState = 0,
    Generic = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdHocCall {
    #[prost(uint64, tag = "1")]
    pub call_id: u64,
    /// Must reference a call link recipient.
    #[prost(uint64, tag = "2")]
    pub recipient_id: u64,
    #[prost(enumeration = "AdHocCallState", tag = "3")]
    pub state: i32,
    #[prost(uint64, tag = "4")]
    pub call_timestamp: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NotificationProfile {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatFolder {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn unknown_oneof_tag_decodes_to_none() {
        // field 15, length-delimited, empty
        let bytes = [0x7a, 0x00];
        let frame = Frame::decode(&bytes[..]).expect("decode");
        assert_eq!(frame.kind(), FrameKind::Unknown);
    }

    #[test]
    fn unknown_direction_value_is_preserved_as_int() {
        let item = ChatItem {
            direction: 9,
            ..ChatItem::default()
        };
        let decoded = ChatItem::decode(item.encode_to_vec().as_slice()).expect("decode");
        assert_eq!(decoded.direction, 9);
        assert!(Direction::try_from(decoded.direction).is_err());
    }
}

// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Contracts between the pipelines and the per-entity archivers.
//!
//! An archiver owns one kind of record. On export it reads local state through the
//! [`ArchivingContext`] and writes frames to a [`FrameSink`]; on import it receives
//! decoded records and writes local state through the [`RestoringContext`].

use std::io;

use crate::{
    context::{ArchivingContext, RecipientId, RestoringContext},
    frame_error::{
        ArchiveFrameError, ArchiveFrameErrorKind, FatalArchivingError, LoggableId,
        RestoreFrameError, UnrecognizedEnumError,
    },
    proto::{
        AccountData, AdHocCall, CallLink, Chat, ChatItem, Contact, DistributionListItem, Frame,
        Group, ReleaseNotes, SelfRecipient, StickerPack,
    },
};

/// Result of archiving exactly one record.
pub type ArchiveSingleFrameResult<T> = Result<T, ArchiveFrameError>;

/// Result of archiving every record of one kind.
#[derive(Debug)]
pub enum ArchiveMultiFrameResult {
    Success,
    /// Some records were left out; the rest were written.
    PartialSuccess(Vec<ArchiveFrameError>),
    /// The archiver could not continue. The export is aborted.
    CompleteFailure(FatalArchivingError),
}

impl ArchiveMultiFrameResult {
    /// Collapse a list of per-record errors into a result.
    pub fn from_errors(errors: Vec<ArchiveFrameError>) -> Self {
        if errors.is_empty() {
            Self::Success
        } else {
            Self::PartialSuccess(errors)
        }
    }
}

/// Result of restoring one record.
#[derive(Debug)]
pub enum RestoreFrameResult<T> {
    Success(T),
    /// A field holds an enum value this build doesn't know. The record is dropped.
    UnrecognizedEnum(UnrecognizedEnumError),
    /// The record was restored without some of its content.
    PartialRestore(T, Vec<RestoreFrameError>),
    /// The record was not restored.
    Failure(Vec<RestoreFrameError>),
}

impl<T> RestoreFrameResult<T> {
    /// Shorthand for a single-error failure.
    pub fn failure(error: RestoreFrameError) -> Self {
        Self::Failure(vec![error])
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Discard the success value.
    pub fn map_unit(self) -> RestoreFrameResult<()> {
        match self {
            Self::Success(_) => RestoreFrameResult::Success(()),
            Self::UnrecognizedEnum(e) => RestoreFrameResult::UnrecognizedEnum(e),
            Self::PartialRestore(_, errors) => RestoreFrameResult::PartialRestore((), errors),
            Self::Failure(errors) => RestoreFrameResult::Failure(errors),
        }
    }
}

/// Destination of archived frames.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()>;
}

/// In-memory sink, for tests and tooling.
impl FrameSink for Vec<Frame> {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.push(frame.clone());
        Ok(())
    }
}

/// Write one frame, mapping a stream failure to a serialization error for `id`.
#[track_caller]
pub fn write_frame(
    sink: &mut dyn FrameSink,
    frame: &Frame,
    id: impl FnOnce() -> LoggableId,
) -> ArchiveSingleFrameResult<()> {
    match sink.write_frame(frame) {
        Ok(()) => Ok(()),
        Err(e) => Err(ArchiveFrameError::new(
            ArchiveFrameErrorKind::ProtoSerialization(e.to_string()),
            id(),
        )),
    }
}

// ============================================================================
// Archiver traits
// ============================================================================

/// The account data record. Exactly one per archive; failure aborts the operation.
pub trait AccountDataArchiver: Send + Sync {
    fn archive(
        &self,
        sink: &mut dyn FrameSink,
        ctx: &ArchivingContext<'_>,
    ) -> ArchiveSingleFrameResult<()>;

    fn restore(&self, data: &AccountData, ctx: &RestoringContext<'_>) -> RestoreFrameResult<()>;
}

/// The local account's own recipient. Failure aborts the export.
pub trait LocalRecipientArchiver: Send + Sync {
    fn archive(
        &self,
        sink: &mut dyn FrameSink,
        ctx: &ArchivingContext<'_>,
    ) -> ArchiveSingleFrameResult<RecipientId>;

    fn restore(
        &self,
        id: RecipientId,
        proto: &SelfRecipient,
        ctx: &RestoringContext<'_>,
    ) -> RestoreFrameResult<()>;
}

/// One destination kind of recipient frames.
pub trait RecipientArchiver<P>: Send + Sync {
    fn archive(
        &self,
        sink: &mut dyn FrameSink,
        ctx: &ArchivingContext<'_>,
    ) -> ArchiveMultiFrameResult;

    fn restore(
        &self,
        id: RecipientId,
        proto: &P,
        ctx: &RestoringContext<'_>,
    ) -> RestoreFrameResult<()>;
}

/// Any other record kind.
pub trait FrameArchiver<P>: Send + Sync {
    fn archive(
        &self,
        sink: &mut dyn FrameSink,
        ctx: &ArchivingContext<'_>,
    ) -> ArchiveMultiFrameResult;

    fn restore(&self, proto: &P, ctx: &RestoringContext<'_>) -> RestoreFrameResult<()>;
}

/// Every archiver the pipelines drive, in one bundle.
pub struct Archivers {
    pub account_data: Box<dyn AccountDataArchiver>,
    pub local_recipient: Box<dyn LocalRecipientArchiver>,
    pub release_notes: Box<dyn RecipientArchiver<ReleaseNotes>>,
    pub contacts: Box<dyn RecipientArchiver<Contact>>,
    pub groups: Box<dyn RecipientArchiver<Group>>,
    pub distribution_lists: Box<dyn RecipientArchiver<DistributionListItem>>,
    pub call_links: Box<dyn RecipientArchiver<CallLink>>,
    pub chats: Box<dyn FrameArchiver<Chat>>,
    pub chat_items: Box<dyn FrameArchiver<ChatItem>>,
    pub sticker_packs: Box<dyn FrameArchiver<StickerPack>>,
    pub ad_hoc_calls: Box<dyn FrameArchiver<AdHocCall>>,
}

impl std::fmt::Debug for Archivers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archivers").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frame_error::LoggableError, proto::frame};

    struct FailingSink;

    impl FrameSink for FailingSink {
        fn write_frame(&mut self, _frame: &Frame) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
    }

    #[test]
    fn write_failure_becomes_serialization_error() {
        let frame = Frame::new(frame::Item::StickerPack(StickerPack::default()));
        let err = write_frame(&mut FailingSink, &frame, || LoggableId::sticker_pack(&[1]))
            .expect_err("fails");
        assert_eq!(
            err.kind(),
            &ArchiveFrameErrorKind::ProtoSerialization("disk full".into())
        );
        assert_eq!(err.collapse_key().as_deref(), Some("disk full"));
        assert!(err.callsite_log_string().contains("archiver.rs"));

        let mut frames: Vec<Frame> = Vec::new();
        write_frame(&mut frames, &frame, || LoggableId::sticker_pack(&[1])).expect("writes");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn multi_frame_result_from_errors() {
        assert!(matches!(
            ArchiveMultiFrameResult::from_errors(Vec::new()),
            ArchiveMultiFrameResult::Success
        ));
        let err = ArchiveFrameError::new(
            ArchiveFrameErrorKind::FetchFailed("x".into()),
            LoggableId::chat(1),
        );
        assert!(matches!(
            ArchiveMultiFrameResult::from_errors(vec![err]),
            ArchiveMultiFrameResult::PartialSuccess(errors) if errors.len() == 1
        ));
    }
}

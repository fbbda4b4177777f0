// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Per-record error classification.
//!
//! Archivers and restorers report failures for individual records without stopping
//! the whole operation. Each error carries the identity of the record, a structured
//! kind, a severity and the callsite that raised it. Errors that share a collapse
//! key are logged once with a count (see [`crate::collapse`]).

use std::{fmt, panic::Location};

use strum::{Display, IntoStaticStr};

/// Severity of a recorded error. Ordered: `Verbose < Warning < Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Verbose,
    Warning,
    Error,
}

/// Identity of the record an error refers to, e.g. `Recipient.12`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoggableId {
    type_name: &'static str,
    id: String,
}

impl LoggableId {
    pub fn new(type_name: &'static str, id: impl fmt::Display) -> Self {
        Self {
            type_name,
            id: id.to_string(),
        }
    }

    pub fn account_data() -> Self {
        Self::new("AccountData", "local")
    }

    pub fn recipient(id: u64) -> Self {
        Self::new("Recipient", id)
    }

    pub fn chat(id: u64) -> Self {
        Self::new("Chat", id)
    }

    pub fn chat_item(chat_id: u64, date_sent: u64) -> Self {
        Self::new("ChatItem", format_args!("{chat_id}:{date_sent}"))
    }

    pub fn sticker_pack(pack_id: &[u8]) -> Self {
        Self::new("StickerPack", hex::encode(pack_id))
    }

    pub fn ad_hoc_call(call_id: u64) -> Self {
        Self::new("AdHocCall", call_id)
    }

    pub fn frame(index: u64) -> Self {
        Self::new("Frame", index)
    }

    /// A row of the local store, used on export before an archive id exists.
    pub fn local_row(table: &'static str, row_id: i64) -> Self {
        Self::new(table, row_id)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Display for LoggableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_name, self.id)
    }
}

/// Common view over every recorded error.
pub trait LoggableError: fmt::Debug {
    /// Short description of the error type, shared by all instances of a kind.
    fn type_log_string(&self) -> String;

    /// Identity of the affected record; empty when there is none.
    fn id_log_string(&self) -> String;

    /// `file:line` where the error was raised.
    fn callsite_log_string(&self) -> String;

    /// Errors with equal keys (and equal levels) are logged together. `None` logs
    /// each instance on its own.
    fn collapse_key(&self) -> Option<String>;

    fn log_level(&self) -> LogLevel;
}

fn callsite(location: &Location<'_>) -> String {
    format!("{}:{}", location.file(), location.line())
}

// ============================================================================
// Export
// ============================================================================

/// What went wrong archiving one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveFrameErrorKind {
    /// The frame could not be encoded or written to the stream.
    ProtoSerialization(String),
    /// The record refers to a recipient that was not archived.
    ReferencedRecipientMissing(i64),
    /// The record refers to a chat that was not archived.
    ReferencedChatMissing(i64),
    /// The local row is unusable (e.g. contact without any identifier).
    InvalidLocalData(String),
    /// Reading the local row failed.
    FetchFailed(String),
}

/// Failure archiving a single record. The record is left out of the archive.
#[derive(Debug, Clone)]
pub struct ArchiveFrameError {
    kind: ArchiveFrameErrorKind,
    id: LoggableId,
    callsite: &'static Location<'static>,
}

impl ArchiveFrameError {
    #[track_caller]
    pub fn new(kind: ArchiveFrameErrorKind, id: LoggableId) -> Self {
        Self {
            kind,
            id,
            callsite: Location::caller(),
        }
    }

    pub fn kind(&self) -> &ArchiveFrameErrorKind {
        &self.kind
    }

    pub fn id(&self) -> &LoggableId {
        &self.id
    }
}

impl LoggableError for ArchiveFrameError {
    fn type_log_string(&self) -> String {
        let kind = match &self.kind {
            ArchiveFrameErrorKind::ProtoSerialization(_) => "protoSerializationError",
            ArchiveFrameErrorKind::ReferencedRecipientMissing(_) => "referencedRecipientIdMissing",
            ArchiveFrameErrorKind::ReferencedChatMissing(_) => "referencedThreadIdMissing",
            ArchiveFrameErrorKind::InvalidLocalData(_) => "invalidLocalData",
            ArchiveFrameErrorKind::FetchFailed(_) => "fetchFailed",
        };
        format!("ArchiveFrameError: {kind}")
    }

    fn id_log_string(&self) -> String {
        self.id.to_string()
    }

    fn callsite_log_string(&self) -> String {
        callsite(self.callsite)
    }

    fn collapse_key(&self) -> Option<String> {
        match &self.kind {
            ArchiveFrameErrorKind::ProtoSerialization(raw) => Some(raw.clone()),
            ArchiveFrameErrorKind::ReferencedRecipientMissing(_)
            | ArchiveFrameErrorKind::ReferencedChatMissing(_) => Some(self.type_log_string()),
            ArchiveFrameErrorKind::InvalidLocalData(_) | ArchiveFrameErrorKind::FetchFailed(_) => {
                None
            }
        }
    }

    fn log_level(&self) -> LogLevel {
        match &self.kind {
            ArchiveFrameErrorKind::ReferencedRecipientMissing(_)
            | ArchiveFrameErrorKind::ReferencedChatMissing(_)
            | ArchiveFrameErrorKind::InvalidLocalData(_) => LogLevel::Warning,
            ArchiveFrameErrorKind::ProtoSerialization(_) | ArchiveFrameErrorKind::FetchFailed(_) => {
                LogLevel::Error
            }
        }
    }
}

impl fmt::Display for ArchiveFrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:?}", self.type_log_string(), self.id, self.kind)
    }
}

/// Failure that stops an archiver entirely (e.g. the local table cannot be iterated).
#[derive(Debug, Clone)]
pub struct FatalArchivingError {
    message: String,
    callsite: &'static Location<'static>,
}

impl FatalArchivingError {
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            callsite: Location::caller(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl LoggableError for FatalArchivingError {
    fn type_log_string(&self) -> String {
        format!("FatalArchiveError: {}", self.message)
    }

    fn id_log_string(&self) -> String {
        String::new()
    }

    fn callsite_log_string(&self) -> String {
        callsite(self.callsite)
    }

    fn collapse_key(&self) -> Option<String> {
        None
    }

    fn log_level(&self) -> LogLevel {
        LogLevel::Error
    }
}

impl fmt::Display for FatalArchivingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_log_string())
    }
}

// ============================================================================
// Import
// ============================================================================

/// A record in the archive is self-inconsistent or refers to something that doesn't exist.
#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum InvalidProtoDataError {
    RecipientIdNotFound(u64),
    ChatIdNotFound(u64),
    RecipientMissingDestination,
    ContactWithoutIdentifiers,
    InvalidAci,
    InvalidE164,
    InvalidProfileKey,
    InvalidGroupMasterKey,
    InvalidDistributionListId,
    DistributionListMemberNotContact(u64),
    ChatItemMissingItem,
    ChatItemInvalidDateSent,
    EmptyStandardMessage,
    FilePointerMissingMediaName,
    AdHocCallNotCallLink(u64),
    InvalidStickerPack,
    MissingLocalProfileKey,
}

impl InvalidProtoDataError {
    fn log_level(&self) -> LogLevel {
        match self {
            // the record is still restored, minus the offending field
            Self::InvalidE164
            | Self::InvalidProfileKey
            | Self::DistributionListMemberNotContact(_)
            | Self::FilePointerMissingMediaName => LogLevel::Warning,
            _ => LogLevel::Error,
        }
    }
}

/// What went wrong restoring one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreFrameErrorKind {
    InvalidProtoData(InvalidProtoDataError),
    /// A chat id resolved but its local thread row is gone.
    ReferencedChatThreadNotFound(i64),
    /// The attachment row could not be created.
    FailedToCreateAttachment,
    /// A freshly inserted model has no row id.
    DatabaseModelMissingRowId(&'static str),
    DatabaseInsertionFailed(String),
    FailedToEnqueueAttachmentDownload(String),
    /// Invariant violated in our own code.
    DeveloperError(String),
    /// Known record shape that is not restored yet.
    Unimplemented,
}

/// Failure restoring a single record.
#[derive(Debug, Clone)]
pub struct RestoreFrameError {
    kind: RestoreFrameErrorKind,
    id: LoggableId,
    callsite: &'static Location<'static>,
}

impl RestoreFrameError {
    #[track_caller]
    pub fn new(kind: RestoreFrameErrorKind, id: LoggableId) -> Self {
        Self {
            kind,
            id,
            callsite: Location::caller(),
        }
    }

    #[track_caller]
    pub fn invalid(error: InvalidProtoDataError, id: LoggableId) -> Self {
        Self::new(RestoreFrameErrorKind::InvalidProtoData(error), id)
    }

    #[track_caller]
    pub fn database(error: &rusqlite::Error, id: LoggableId) -> Self {
        Self::new(
            RestoreFrameErrorKind::DatabaseInsertionFailed(error.to_string()),
            id,
        )
    }

    pub fn kind(&self) -> &RestoreFrameErrorKind {
        &self.kind
    }

    pub fn id(&self) -> &LoggableId {
        &self.id
    }
}

impl LoggableError for RestoreFrameError {
    fn type_log_string(&self) -> String {
        let kind = match &self.kind {
            RestoreFrameErrorKind::InvalidProtoData(e) => {
                format!("invalidProtoData.{}", <&'static str>::from(e))
            }
            RestoreFrameErrorKind::ReferencedChatThreadNotFound(_) => {
                "referencedChatThreadNotFound".to_string()
            }
            RestoreFrameErrorKind::FailedToCreateAttachment => "failedToCreateAttachment".to_string(),
            RestoreFrameErrorKind::DatabaseModelMissingRowId(model) => {
                format!("databaseModelMissingRowId.{model}")
            }
            RestoreFrameErrorKind::DatabaseInsertionFailed(_) => {
                "databaseInsertionFailed".to_string()
            }
            RestoreFrameErrorKind::FailedToEnqueueAttachmentDownload(_) => {
                "failedToEnqueueAttachmentDownload".to_string()
            }
            RestoreFrameErrorKind::DeveloperError(message) => format!("developerError: {message}"),
            RestoreFrameErrorKind::Unimplemented => "unimplemented".to_string(),
        };
        format!("RestoreFrameError: {kind}")
    }

    fn id_log_string(&self) -> String {
        self.id.to_string()
    }

    fn callsite_log_string(&self) -> String {
        callsite(self.callsite)
    }

    fn collapse_key(&self) -> Option<String> {
        match &self.kind {
            RestoreFrameErrorKind::InvalidProtoData(
                InvalidProtoDataError::RecipientIdNotFound(_)
                | InvalidProtoDataError::ChatIdNotFound(_),
            )
            | RestoreFrameErrorKind::ReferencedChatThreadNotFound(_)
            | RestoreFrameErrorKind::FailedToCreateAttachment => Some(self.type_log_string()),
            RestoreFrameErrorKind::InvalidProtoData(_) => Some(self.id_log_string()),
            RestoreFrameErrorKind::DatabaseModelMissingRowId(model) => Some((*model).to_string()),
            RestoreFrameErrorKind::DatabaseInsertionFailed(raw)
            | RestoreFrameErrorKind::FailedToEnqueueAttachmentDownload(raw) => Some(raw.clone()),
            RestoreFrameErrorKind::DeveloperError(_) => None,
            RestoreFrameErrorKind::Unimplemented => Some(self.callsite_log_string()),
        }
    }

    fn log_level(&self) -> LogLevel {
        match &self.kind {
            RestoreFrameErrorKind::InvalidProtoData(e) => e.log_level(),
            RestoreFrameErrorKind::FailedToCreateAttachment
            | RestoreFrameErrorKind::FailedToEnqueueAttachmentDownload(_)
            | RestoreFrameErrorKind::Unimplemented => LogLevel::Warning,
            RestoreFrameErrorKind::ReferencedChatThreadNotFound(_)
            | RestoreFrameErrorKind::DatabaseModelMissingRowId(_)
            | RestoreFrameErrorKind::DatabaseInsertionFailed(_)
            | RestoreFrameErrorKind::DeveloperError(_) => LogLevel::Error,
        }
    }
}

impl fmt::Display for RestoreFrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.type_log_string(), self.id)
    }
}

/// An enum field (or the frame's record kind) has a value this build doesn't know.
/// The frame is dropped; logged as a warning.
#[derive(Debug, Clone)]
pub struct UnrecognizedEnumError {
    enum_type: &'static str,
    value: i32,
    id: LoggableId,
    callsite: &'static Location<'static>,
}

impl UnrecognizedEnumError {
    #[track_caller]
    pub fn new(enum_type: &'static str, value: i32, id: LoggableId) -> Self {
        Self {
            enum_type,
            value,
            id,
            callsite: Location::caller(),
        }
    }

    pub fn enum_type(&self) -> &'static str {
        self.enum_type
    }
}

impl LoggableError for UnrecognizedEnumError {
    fn type_log_string(&self) -> String {
        format!("UnrecognizedEnum: {}", self.enum_type)
    }

    fn id_log_string(&self) -> String {
        format!("{} (value {})", self.id, self.value)
    }

    fn callsite_log_string(&self) -> String {
        callsite(self.callsite)
    }

    fn collapse_key(&self) -> Option<String> {
        Some(self.type_log_string())
    }

    fn log_level(&self) -> LogLevel {
        LogLevel::Warning
    }
}

/// A frame whose bytes could not be decoded; skipped outside strict mode.
#[derive(Debug, Clone)]
pub struct FrameDecodeError {
    message: String,
    id: LoggableId,
    callsite: &'static Location<'static>,
}

impl FrameDecodeError {
    #[track_caller]
    pub fn new(message: impl Into<String>, frame_index: u64) -> Self {
        Self {
            message: message.into(),
            id: LoggableId::frame(frame_index),
            callsite: Location::caller(),
        }
    }
}

impl LoggableError for FrameDecodeError {
    fn type_log_string(&self) -> String {
        "FrameDecodeError".to_string()
    }

    fn id_log_string(&self) -> String {
        self.id.to_string()
    }

    fn callsite_log_string(&self) -> String {
        callsite(self.callsite)
    }

    fn collapse_key(&self) -> Option<String> {
        Some(self.message.clone())
    }

    fn log_level(&self) -> LogLevel {
        LogLevel::Error
    }
}

// ============================================================================
// Recorded errors
// ============================================================================

/// Any error recorded during an export or import.
#[derive(Debug, Clone)]
pub enum FrameError {
    Archive(ArchiveFrameError),
    FatalArchive(FatalArchivingError),
    Restore(RestoreFrameError),
    UnrecognizedEnum(UnrecognizedEnumError),
    Decode(FrameDecodeError),
}

impl FrameError {
    fn inner(&self) -> &dyn LoggableError {
        match self {
            Self::Archive(e) => e,
            Self::FatalArchive(e) => e,
            Self::Restore(e) => e,
            Self::UnrecognizedEnum(e) => e,
            Self::Decode(e) => e,
        }
    }
}

impl LoggableError for FrameError {
    fn type_log_string(&self) -> String {
        self.inner().type_log_string()
    }

    fn id_log_string(&self) -> String {
        self.inner().id_log_string()
    }

    fn callsite_log_string(&self) -> String {
        self.inner().callsite_log_string()
    }

    fn collapse_key(&self) -> Option<String> {
        self.inner().collapse_key()
    }

    fn log_level(&self) -> LogLevel {
        self.inner().log_level()
    }
}

impl From<ArchiveFrameError> for FrameError {
    fn from(e: ArchiveFrameError) -> Self {
        Self::Archive(e)
    }
}

impl From<FatalArchivingError> for FrameError {
    fn from(e: FatalArchivingError) -> Self {
        Self::FatalArchive(e)
    }
}

impl From<RestoreFrameError> for FrameError {
    fn from(e: RestoreFrameError) -> Self {
        Self::Restore(e)
    }
}

impl From<UnrecognizedEnumError> for FrameError {
    fn from(e: UnrecognizedEnumError) -> Self {
        Self::UnrecognizedEnum(e)
    }
}

impl From<FrameDecodeError> for FrameError {
    fn from(e: FrameDecodeError) -> Self {
        Self::Decode(e)
    }
}

/// An error plus whether its frame was left out of the output.
#[derive(Debug, Clone)]
pub struct FrameErrorRecord {
    pub error: FrameError,
    pub was_frame_dropped: bool,
}

impl FrameErrorRecord {
    pub fn new(error: impl Into<FrameError>, was_frame_dropped: bool) -> Self {
        Self {
            error: error.into(),
            was_frame_dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Verbose < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn callsite_points_at_constructor_caller() {
        let err = RestoreFrameError::new(
            RestoreFrameErrorKind::DeveloperError("boom".into()),
            LoggableId::chat(1),
        );
        let line = line!() - 4;
        assert_eq!(
            err.callsite_log_string(),
            format!("{}:{line}", file!())
        );
    }

    #[test]
    fn restore_collapse_keys() {
        let missing = |id| {
            RestoreFrameError::invalid(
                InvalidProtoDataError::RecipientIdNotFound(id),
                LoggableId::chat(id),
            )
        };
        // same type, different ids: one bucket
        assert_eq!(missing(1).collapse_key(), missing(2).collapse_key());

        // other invalid data collapses per record
        let bad_key = |id| {
            RestoreFrameError::invalid(InvalidProtoDataError::InvalidAci, LoggableId::recipient(id))
        };
        assert_ne!(bad_key(1).collapse_key(), bad_key(2).collapse_key());
        assert_eq!(bad_key(1).collapse_key().as_deref(), Some("Recipient.1"));

        let insert = |msg: &str| {
            RestoreFrameError::new(
                RestoreFrameErrorKind::DatabaseInsertionFailed(msg.into()),
                LoggableId::recipient(1),
            )
        };
        assert_eq!(insert("UNIQUE").collapse_key().as_deref(), Some("UNIQUE"));

        let dev = RestoreFrameError::new(
            RestoreFrameErrorKind::DeveloperError("x".into()),
            LoggableId::recipient(1),
        );
        assert_eq!(dev.collapse_key(), None);
    }

    #[test]
    fn fatal_archiving_error_has_no_id_and_never_collapses() {
        let err = FatalArchivingError::new("iterator failed");
        assert_eq!(err.id_log_string(), "");
        assert_eq!(err.collapse_key(), None);
        assert_eq!(err.log_level(), LogLevel::Error);
        assert_eq!(err.type_log_string(), "FatalArchiveError: iterator failed");
    }

    #[test]
    fn unrecognized_enum_is_a_warning() {
        let err = UnrecognizedEnumError::new("Direction", 9, LoggableId::chat_item(1, 100));
        assert_eq!(err.log_level(), LogLevel::Warning);
        assert_eq!(err.id_log_string(), "ChatItem.1:100 (value 9)");
    }
}

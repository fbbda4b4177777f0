// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Errors returned by the backup archive engine
//!
use std::path::PathBuf;

use snafu::prelude::*;

pub use crate::forward_secrecy::KeyDerivationError;
use crate::restore_state::BackupRestoreState;

/// Top-level errors returned by export, import, finalize and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BackupError {
    /// File system error
    #[snafu(display("io error {path:?}: {source}"))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Local database error
    #[snafu(display("database: {source}"))]
    Sqlite { source: rusqlite::Error },

    /// The nonce metadata header at the start of the archive is unusable.
    #[snafu(display("archive header: {source}"))]
    Header { source: HeaderError },

    /// The frame stream could not be read (truncation, authentication failure, corrupt frame).
    #[snafu(display("reading archive: {source}"))]
    FrameRead { source: FrameReadError },

    /// The frame stream could not be written.
    #[snafu(display("writing archive: {source}"))]
    FrameWrite { source: std::io::Error },

    /// Archive was produced by an unsupported format version.
    #[snafu(display("unsupported backup version {version} (supported: {supported})"))]
    UnsupportedVersion { version: u64, supported: u64 },

    /// Archive key could not be derived.
    #[snafu(display("key derivation: {source}"))]
    KeyDerivation { source: KeyDerivationError },

    /// The caller cancelled the operation.
    #[snafu(display("operation cancelled"))]
    Cancelled,

    /// Export aborted; the output file has been discarded.
    #[snafu(display("export failed: {message}"))]
    ExportFailed { message: String },

    /// Import aborted; the transaction has been rolled back.
    #[snafu(display("import failed: {message}"))]
    ImportFailed { message: String },

    /// Import was attempted on a store that has already restored (or started restoring) a backup.
    #[snafu(display("backup already restored or in progress (state: {state})"))]
    AlreadyRestored { state: BackupRestoreState },

    /// Finalize was requested but no import has completed.
    #[snafu(display("no restored backup to finalize"))]
    NotRestored,

    /// Archive failed validation.
    #[snafu(display("validation: {source}"))]
    Validation { source: ValidationError },

    /// Upload or download failure.
    #[snafu(display("transport: {source}"))]
    Transport { source: TransportError },

    /// Invalid configuration value.
    #[snafu(display("configuration: {message}"))]
    Config { message: String },

    /// Blocking worker panicked or was aborted.
    #[snafu(display("background task failed: {source}"))]
    Join { source: tokio::task::JoinError },

    /// Some other error occurred
    #[snafu(display("{message}"))]
    Other { message: String },
}

impl BackupError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<rusqlite::Error> for BackupError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Sqlite { source }
    }
}

impl From<HeaderError> for BackupError {
    fn from(source: HeaderError) -> Self {
        Self::Header { source }
    }
}

impl From<FrameReadError> for BackupError {
    fn from(source: FrameReadError) -> Self {
        Self::FrameRead { source }
    }
}

impl From<ValidationError> for BackupError {
    fn from(source: ValidationError) -> Self {
        Self::Validation { source }
    }
}

impl From<TransportError> for BackupError {
    fn from(source: TransportError) -> Self {
        Self::Transport { source }
    }
}

// cancellation keeps its identity across layers
impl From<KeyDerivationError> for BackupError {
    fn from(source: KeyDerivationError) -> Self {
        match source {
            KeyDerivationError::Cancelled => Self::Cancelled,
            source => Self::KeyDerivation { source },
        }
    }
}

/// Errors parsing the nonce metadata header.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum HeaderError {
    /// Leading bytes don't match the magic signature. Not recoverable by fetching more bytes.
    #[snafu(display("malformed header signature"))]
    MalformedSignature,

    /// Declared body length exceeds the sanity bound.
    #[snafu(display("header body length {len} exceeds maximum {max}"))]
    BodyTooLong { len: u64, max: usize },

    /// Length varint is longer than any valid body length needs.
    #[snafu(display("header length varint overflow"))]
    LengthOverflow,

    /// The file ends before the header does.
    #[snafu(display("archive ends inside the metadata header ({available} of {needed} bytes)"))]
    HeaderTruncated { needed: usize, available: usize },
}

/// Errors reading the frame stream.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FrameReadError {
    #[snafu(display("io: {source}"))]
    ReadIo { source: std::io::Error },

    /// Encrypted stream failed authentication (tampered, truncated or wrong key).
    #[snafu(display("decryption failed: {message}"))]
    Decryption { message: String },

    /// Stream ended in the middle of a frame.
    #[snafu(display("archive truncated: expected {expected} bytes, got {actual}"))]
    Truncated { expected: u64, actual: u64 },

    #[snafu(display("frame length {len} exceeds maximum {max}"))]
    FrameTooLarge { len: u64, max: u64 },

    /// The frame bytes were read but are not a valid record. The reader is positioned
    /// after the frame, so the caller may skip it.
    #[snafu(display("frame decode: {source}"))]
    Decode { source: prost::DecodeError },

    /// Stream is empty; there is no backup info frame.
    #[snafu(display("archive contains no header frame"))]
    MissingBackupInfo,
}

impl FrameReadError {
    /// True if the stream is still usable after this error.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

/// Errors reported by archive validation.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum ValidationError {
    /// The archive is readable but contains fields this version does not understand.
    #[snafu(display("unknown fields: {}", fields.join(", ")))]
    UnknownFields { fields: Vec<String> },

    /// The archive is unreadable.
    #[snafu(display("validation failed: {message}"))]
    ValidationFailed {
        message: String,
        unknown_fields: Vec<String>,
    },

    /// The archive file could not be read.
    #[snafu(display("io: {message}"))]
    ValidationIo { message: String },
}

/// Upload and download errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("transport io {path:?}: {source}"))]
    TransportIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("no backup stored for id {backup_id}"))]
    BackupNotFound { backup_id: String },

    #[snafu(display("upload rejected: {message}"))]
    Rejected { message: String },
}

/*
 * backup-archive - encrypted backup archives for a messaging client
 *
 * SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
 * SPDX-License-Identifier: Apache-2.0
 */
//! # Backup Archive Engine
//!
//! Serializes the full conversation state of a messaging client into a single
//! encrypted, streamable archive, and replays such an archive into a fresh store.
//!
//! ## Features
//!
//! - length-delimited frame stream with a fixed-prefix nonce metadata header
//! - forward-secrecy key derivation against a remote secret recovery service, with
//!   connection retry, rate-limit waits and secret-chain restart
//! - chunked ChaCha20-Poly1305 archive encryption
//! - export pipeline driving per-entity archivers under one read snapshot
//! - import pipeline with per-frame error classification, index drop/recreate,
//!   commit-on-cancel and an idempotent finalize step
//! - severity-ranked, collapsed error reports
//! - progress and attachment byte accounting, per-frame benchmarks
//! - `SQLite` reference store and archivers (`local_store`)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use backup_archive::prelude::*;
//! use secret_recovery::mock::MockSecretRecovery;
//! # async fn example() -> Result<(), BackupError> {
//! let store = LocalStore::open("messages.db")?;
//! let transport = LocalDirectoryTransport::new("/tmp/backups");
//! let manager = BackupArchiveManager::new(
//!     store.connection(),
//!     store.archivers(),
//!     store.hooks(),
//!     MockSecretRecovery::new(),
//!     transport,
//!     ManagerConfig::from_env()?,
//! );
//! let local = LocalIdentifiers::new("5b3c1a6e-0000-4000-8000-000000000001", Some("+15555550100"));
//! let source = KeySource::remote(BackupKey::generate());
//! let cancel = CancellationToken::new();
//! let metadata = manager
//!     .export_encrypted_backup(&local, &source, None, &cancel)
//!     .await?;
//! manager.upload_encrypted_backup(&metadata, &cancel).await?;
//! # Ok(())
//! # }
//! ```
//!
#![allow(clippy::missing_errors_doc)] // pedantic
#![allow(clippy::missing_const_for_fn)] //  nursery function
#![allow(clippy::must_use_candidate)] // pedantic
#![warn(clippy::default_trait_access)]
#![warn(clippy::doc_markdown)]
#![warn(clippy::explicit_iter_loop)]
#![warn(clippy::implicit_clone)]
#![warn(clippy::literal_string_with_formatting_args)]
#![warn(clippy::match_same_arms)]
#![warn(clippy::needless_raw_strings)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::ref_option)]
#![warn(clippy::redundant_closure)]
#![warn(clippy::uninlined_format_args)]
#![warn(clippy::unused_async)]

pub mod accounting;
pub mod archiver;
pub mod bench;
pub mod cancel;
pub mod collapse;
pub mod context;
pub mod crypto;
pub mod error;
pub mod export;
pub mod filter;
pub mod finalize;
pub mod forward_secrecy;
pub mod frame_error;
pub mod header;
pub mod hooks;
pub mod import;
pub mod kv;
pub mod local_store;
pub mod manager;
pub mod nonce_store;
pub mod proto;
pub mod restore_state;
pub mod settings;
pub mod stream;
pub mod transport;
pub mod validate;

/// Result type alias using `BackupError` as the default error.
pub type Result<T, E = crate::error::BackupError> = std::result::Result<T, E>;

/// Prelude module - import the common types with `use backup_archive::prelude::*;`
pub mod prelude {
    pub use super::SUPPORTED_BACKUP_VERSION;
    pub use crate::error::*;
    pub use crate::{
        // progress and byte accounting
        accounting::{AttachmentByteCounter, ProgressPhase, ProgressSink, ProgressUpdate},
        // archiver contracts
        archiver::{
            ArchiveMultiFrameResult, ArchiveSingleFrameResult, Archivers, RestoreFrameResult,
        },
        bench::{BenchSummary, Bencher},
        cancel::CancellationToken,
        collapse::ErrorReport,
        context::{AccountId, BackupPurpose, LocalIdentifiers},
        crypto::{BackupId, BackupKey, EphemeralBackupKey, ForwardSecrecyToken, MediaRootBackupKey},
        filter::IncludedContentFilter,
        forward_secrecy::{KeySource, NonceRotation},
        frame_error::LogLevel,
        header::{HeaderParse, parse_header, serialize_header},
        export::ExportOutcome,
        finalize::FinalizeOutcome,
        hooks::PipelineHooks,
        import::ImportOutcome,
        local_store::{LocalStore, StoreSnapshot},
        manager::{BackupArchiveManager, EncryptedBackupUploadMetadata, ManagerConfig},
        restore_state::BackupRestoreState,
        transport::{BackupTransport, LocalDirectoryTransport, UploadReceipt},
        validate::ValidationReport,
    };
}

// ============================================================================
// CONSTANTS
// ============================================================================

/// The only archive format version this crate reads and writes.
pub const SUPPORTED_BACKUP_VERSION: u64 = 1;

pub(crate) mod config {
    use std::time::Duration;

    /// Magic signature at the start of the nonce metadata header.
    pub const HEADER_MAGIC: [u8; 8] = *b"SBACKUP\x01";

    /// Header body sanity bound.
    pub const MAX_HEADER_BODY_LEN: usize = 65_535;

    /// LEB128 bytes needed for `MAX_HEADER_BODY_LEN`.
    pub const MAX_HEADER_VARINT_LEN: usize = 3;

    /// Initial prefix fetched when looking for the metadata header.
    pub const HEADER_PREFIX_GUESS: usize = 1024;

    /// Largest single frame accepted by the reader.
    pub const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

    /// Plaintext bytes per AEAD segment.
    pub const AEAD_SEGMENT_LEN: usize = 64 * 1024;

    /// Example ids kept per collapsed error entry.
    pub const MAX_COLLAPSED_ID_LOG_COUNT: usize = 10;

    /// Attempts for a secret recovery call that fails with a connection error.
    pub const NETWORK_MAX_ATTEMPTS: u32 = 2;

    /// Maximum consecutive rate-limit retries before failing (0 disables the cap).
    pub const RATE_LIMIT_MAX_RETRIES_DEFAULT: u32 = 5;

    /// Warn when the rate-limit wait exceeds this duration.
    pub const RATE_LIMIT_WAIT_WARN: Duration = Duration::from_secs(30);

    /// Longest single rate-limit sleep; longer server intervals are clamped to it.
    pub const RATE_LIMIT_WAIT_MAX: Duration = Duration::from_secs(15 * 60);

    /// Shortest rate-limit sleep, applied when the server asks for no wait at all.
    pub const RATE_LIMIT_WAIT_MIN: Duration = Duration::from_millis(100);

    /// Table whose secondary indexes are dropped during import.
    pub const INTERACTIONS_TABLE: &str = "message";

    /// Searchable marker logged whenever a frame is dropped.
    pub const DROPPED_FRAME_MARKER: &str = "Dropped frame(s) on backup export or import!!!";

    /// Environment variable overriding the strict restore flag
    pub const STRICT_RESTORE_ENV: &str = "BACKUP_STRICT_RESTORE";

    /// Environment variable to override rate-limit retry cap (0 disables the cap).
    pub const RATE_LIMIT_MAX_RETRIES_ENV: &str = "BACKUP_RATE_LIMIT_MAX_RETRIES";

    /// Environment variable for the directory holding exported archives.
    pub const STAGING_DIR_ENV: &str = "BACKUP_STAGING_DIR";

    /// Environment variable for the client build identifier written into headers.
    pub const APP_VERSION_ENV: &str = "BACKUP_APP_VERSION";

    /// Build identifier used when `APP_VERSION_ENV` is unset.
    pub const DEFAULT_APP_VERSION: &str = env!("CARGO_PKG_VERSION");

    // HKDF info labels
    pub const KDF_BACKUP_ID_INFO: &[u8] = b"backup-archive/v1/backup-id";
    pub const KDF_ARCHIVE_KEY_INFO: &[u8] = b"backup-archive/v1/archive-key";
    pub const KDF_SVR_PASSWORD_INFO: &[u8] = b"backup-archive/v1/svr-password";
    pub const KDF_DEVICE_TRANSFER_INFO: &[u8] = b"backup-archive/v1/device-transfer-key";
}

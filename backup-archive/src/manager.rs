// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! # Backup archive manager
//!
//! Async entry points over the blocking pipelines. Key derivation runs on the
//! caller's task; export, import, finalize, validation and every other access to
//! the shared connection run on the blocking pool, so a long pipeline never parks
//! a runtime worker.
//!
//! Encrypted exports are staged in [`ManagerConfig::staging_dir`]. The nonce
//! rotation returned with an export is only committed after the archive has been
//! uploaded, so a failed upload never advances the secret chain. Validation never
//! touches chain state; an import records the restored seed up front and the
//! restored token only when it commits.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use rusqlite::Connection;
use secret_recovery::SecretRecoveryService;
use serde::Serialize;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::{
    accounting::ProgressSink,
    archiver::Archivers,
    cancel::CancellationToken,
    collapse::ErrorReport,
    config::{
        APP_VERSION_ENV, DEFAULT_APP_VERSION, RATE_LIMIT_MAX_RETRIES_DEFAULT,
        RATE_LIMIT_MAX_RETRIES_ENV, STAGING_DIR_ENV, STRICT_RESTORE_ENV,
    },
    context::{BackupPurpose, LocalIdentifiers},
    crypto::{BackupId, BackupKey, ForwardSecrecyToken, derive_backup_id},
    error::{AlreadyRestoredSnafu, BackupError, IoSnafu, JoinSnafu},
    export::{ExportOutcome, ExportRequest, export_backup},
    finalize::{FinalizeOutcome, finalize_backup_import},
    forward_secrecy::{EncryptionMetadata, KeyDeriver, KeySource, NonceRotation},
    hooks::PipelineHooks,
    import::{ImportOutcome, ImportRequest, import_backup},
    nonce_store::NonceMetadataStore,
    restore_state::{BackupRestoreState, RestoreStateStore},
    settings::{BackupSettingsStore, LastBackup},
    transport::{BackupTransport, UploadReceipt},
    validate::{ValidationReport, validate_archive_file},
};

/// Manager configuration
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Abort import on the first frame that fails to decode or restore.
    pub strict_restore: bool,

    /// Consecutive rate-limit retries before key derivation fails. 0 disables the cap.
    pub rate_limit_max_retries: u32,

    /// Directory where exported archives are written before upload.
    pub staging_dir: PathBuf,

    /// Client build identifier recorded in the archive header.
    pub app_version: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            strict_restore: cfg!(feature = "strict-restore"),
            rate_limit_max_retries: RATE_LIMIT_MAX_RETRIES_DEFAULT,
            staging_dir: std::env::temp_dir().join("backup-archive"),
            app_version: DEFAULT_APP_VERSION.to_string(),
        }
    }
}

impl ManagerConfig {
    /// Defaults, overridden by the `BACKUP_*` environment variables.
    pub fn from_env() -> Result<Self, BackupError> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(STRICT_RESTORE_ENV) {
            config.strict_restore = parse_flag(&value).ok_or_else(|| BackupError::Config {
                message: format!("{STRICT_RESTORE_ENV}: expected a boolean, got '{value}'"),
            })?;
        }
        if let Ok(value) = std::env::var(RATE_LIMIT_MAX_RETRIES_ENV) {
            config.rate_limit_max_retries =
                value.trim().parse().map_err(|e| BackupError::Config {
                    message: format!("{RATE_LIMIT_MAX_RETRIES_ENV}: {e}"),
                })?;
        }
        if let Ok(value) = std::env::var(STAGING_DIR_ENV)
            && !value.is_empty()
        {
            config.staging_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var(APP_VERSION_ENV)
            && !value.is_empty()
        {
            config.app_version = value;
        }
        Ok(config)
    }

    #[must_use]
    pub fn strict_restore(self, strict_restore: bool) -> Self {
        Self {
            strict_restore,
            ..self
        }
    }

    #[must_use]
    pub fn rate_limit_max_retries(self, rate_limit_max_retries: u32) -> Self {
        Self {
            rate_limit_max_retries,
            ..self
        }
    }

    #[must_use]
    pub fn staging_dir(self, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            ..self
        }
    }

    #[must_use]
    pub fn app_version(self, app_version: impl Into<String>) -> Self {
        Self {
            app_version: app_version.into(),
            ..self
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// An encrypted archive ready for upload.
#[derive(Debug, Serialize)]
pub struct EncryptedBackupUploadMetadata {
    pub path: PathBuf,
    pub encrypted_len: u64,
    /// Hex SHA-256 of the file.
    pub sha256: String,
    /// Attachment bytes referenced by the archive.
    pub attachment_byte_size: u64,
    #[serde(skip)]
    pub backup_id: Option<BackupId>,
    pub purpose: BackupPurpose,
    /// Committed by [`BackupArchiveManager::upload_encrypted_backup`].
    #[serde(skip)]
    pub rotation: Option<NonceRotation>,
    pub report: ErrorReport,
}

/// Export, upload, download, import, finalize and validate backups for one store.
pub struct BackupArchiveManager<S, T> {
    db: Arc<Mutex<Connection>>,
    archivers: Arc<Archivers>,
    hooks: PipelineHooks,
    keys: KeyDeriver<S>,
    transport: T,
    config: ManagerConfig,
}

impl<S, T> std::fmt::Debug for BackupArchiveManager<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupArchiveManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, T> BackupArchiveManager<S, T>
where
    S: SecretRecoveryService,
    T: BackupTransport,
{
    pub fn new(
        db: Arc<Mutex<Connection>>,
        archivers: Archivers,
        hooks: PipelineHooks,
        svr: S,
        transport: T,
        config: ManagerConfig,
    ) -> Self {
        let keys = KeyDeriver::new(
            svr,
            Arc::clone(&db),
            NonceMetadataStore::new(),
            config.rate_limit_max_retries,
        );
        Self {
            db,
            archivers: Arc::new(archivers),
            hooks,
            keys,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run `f` on the blocking pool with the connection locked.
    async fn run_blocking<R, F>(&self, f: F) -> Result<R, BackupError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection, &Archivers, &PipelineHooks) -> Result<R, BackupError>
            + Send
            + 'static,
    {
        let db = Arc::clone(&self.db);
        let archivers = Arc::clone(&self.archivers);
        let hooks = self.hooks.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock();
            f(&mut *conn, &archivers, &hooks)
        })
        .await
        .context(JoinSnafu)?
    }

    async fn staging_path(&self, prefix: &str) -> Result<PathBuf, BackupError> {
        let dir = &self.config.staging_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .context(IoSnafu { path: dir })?;
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
        Ok(dir.join(format!("{prefix}-{stamp}.bin")))
    }

    /// Derive a key through `source` and export an encrypted archive into the staging directory.
    pub async fn export_encrypted_backup(
        &self,
        local: &LocalIdentifiers,
        source: &KeySource,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<EncryptedBackupUploadMetadata, BackupError> {
        cancel.check()?;
        let purpose = source.purpose();
        let EncryptionMetadata {
            archive_key,
            backup_id,
            metadata_header,
            rotation,
        } = self.keys.export_key(source, local, cancel).await?;
        let path = self.staging_path("backup").await?;

        let outcome = {
            let local = local.clone();
            let app_version = self.config.app_version.clone();
            let cancel = cancel.clone();
            let path = path.clone();
            self.run_blocking(move |conn, archivers, hooks| {
                let request = ExportRequest {
                    path: &path,
                    local: &local,
                    purpose,
                    key: Some(&archive_key),
                    metadata_header: metadata_header.as_deref(),
                    app_version: &app_version,
                    progress,
                };
                export_backup(conn, archivers, hooks, &request, &cancel)
            })
            .await?
        };

        info!(
            path = %outcome.path.display(),
            len = outcome.file_len,
            frames = outcome.frame_count,
            "encrypted backup ready"
        );
        Ok(EncryptedBackupUploadMetadata {
            path: outcome.path,
            encrypted_len: outcome.file_len,
            sha256: outcome.sha256,
            attachment_byte_size: outcome.attachment_bytes,
            backup_id,
            purpose,
            rotation,
            report: outcome.report,
        })
    }

    /// Export an unencrypted archive to `path`. For debugging and tests.
    pub async fn export_plaintext_backup(
        &self,
        path: &Path,
        local: &LocalIdentifiers,
        purpose: BackupPurpose,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<ExportOutcome, BackupError> {
        cancel.check()?;
        let path = path.to_path_buf();
        let local = local.clone();
        let app_version = self.config.app_version.clone();
        let cancel = cancel.clone();
        self.run_blocking(move |conn, archivers, hooks| {
            let request = ExportRequest {
                path: &path,
                local: &local,
                purpose,
                key: None,
                metadata_header: None,
                app_version: &app_version,
                progress,
            };
            export_backup(conn, archivers, hooks, &request, &cancel)
        })
        .await
    }

    /// Upload an exported archive, then commit its nonce rotation.
    pub async fn upload_encrypted_backup(
        &self,
        metadata: &EncryptedBackupUploadMetadata,
        cancel: &CancellationToken,
    ) -> Result<UploadReceipt, BackupError> {
        cancel.check()?;
        let backup_id = metadata.backup_id.ok_or_else(|| BackupError::Other {
            message: "device transfer archives are not uploaded".to_string(),
        })?;
        let receipt = tokio::select! {
            result = self.transport.upload(&metadata.path, &backup_id) => result?,
            () = cancel.cancelled() => return Err(BackupError::Cancelled),
        };
        if let Some(rotation) = metadata.rotation.clone() {
            let store = *self.keys.nonce_store();
            self.run_blocking(move |conn, _, _| Ok(rotation.commit(conn, &store)?))
                .await?;
            debug!(%backup_id, "nonce rotation committed");
        }
        info!(%backup_id, location = %receipt.location, len = receipt.len, "backup uploaded");
        Ok(receipt)
    }

    /// Fetch the remote backup for `backup_key` into the staging directory.
    pub async fn download_encrypted_backup(
        &self,
        local: &LocalIdentifiers,
        backup_key: &BackupKey,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, BackupError> {
        cancel.check()?;
        let backup_id = derive_backup_id(backup_key, &local.aci)?;
        let dir = &self.config.staging_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .context(IoSnafu { path: dir })?;
        let path = tokio::select! {
            result = self.transport.download(&backup_id, dir) => result?,
            () = cancel.cancelled() => return Err(BackupError::Cancelled),
        };
        info!(%backup_id, path = %path.display(), "backup downloaded");
        Ok(path)
    }

    /// Derive a key through `source` and import the encrypted archive at `path`.
    pub async fn import_encrypted_backup(
        &self,
        path: &Path,
        local: &LocalIdentifiers,
        source: &KeySource,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<ImportOutcome, BackupError> {
        cancel.check()?;
        // fail before spending a secret recovery call
        let state = self.backup_restore_state().await?;
        ensure!(
            state == BackupRestoreState::None,
            AlreadyRestoredSnafu { state }
        );
        let decryption = self.keys.import_key(source, local, path, cancel).await?;
        let purpose = source.purpose();
        let path = path.to_path_buf();
        let local = local.clone();
        let strict = self.config.strict_restore;
        let cancel = cancel.clone();
        let nonce_store = *self.keys.nonce_store();
        self.run_blocking(move |conn, archivers, hooks| {
            if let Some(chain) = &decryption.restored {
                // the restored seed continues the chain whatever the import outcome
                nonce_store.set_next_secret_metadata(conn, &chain.next_secret_metadata)?;
            }
            let request = ImportRequest {
                path: &path,
                local: &local,
                purpose,
                key: Some(&decryption.archive_key),
                header_len: decryption.header_len,
                strict,
                forward_secrecy_token: decryption
                    .restored
                    .as_ref()
                    .map(|chain| &chain.forward_secrecy_token),
                progress,
            };
            import_backup(conn, archivers, hooks, &request, &cancel)
        })
        .await
    }

    /// Import an unencrypted archive. For debugging and tests.
    pub async fn import_plaintext_backup(
        &self,
        path: &Path,
        local: &LocalIdentifiers,
        purpose: BackupPurpose,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<ImportOutcome, BackupError> {
        cancel.check()?;
        let path = path.to_path_buf();
        let local = local.clone();
        let strict = self.config.strict_restore;
        let cancel = cancel.clone();
        self.run_blocking(move |conn, archivers, hooks| {
            let request = ImportRequest {
                path: &path,
                local: &local,
                purpose,
                key: None,
                header_len: 0,
                strict,
                forward_secrecy_token: None,
                progress,
            };
            import_backup(conn, archivers, hooks, &request, &cancel)
        })
        .await
    }

    /// Schedule deferred restore work and mark the restore finalized.
    pub async fn finalize_backup_import(
        &self,
        cancel: &CancellationToken,
    ) -> Result<FinalizeOutcome, BackupError> {
        let cancel = cancel.clone();
        self.run_blocking(move |conn, _, hooks| finalize_backup_import(conn, hooks, &cancel))
            .await
    }

    /// Check an encrypted archive without importing it. Chain state is left as is,
    /// so validating an export before its upload is safe.
    ///
    /// Validation failures are handed to the error presenter before being returned.
    pub async fn validate_encrypted_backup(
        &self,
        path: &Path,
        local: &LocalIdentifiers,
        source: &KeySource,
        cancel: &CancellationToken,
    ) -> Result<ValidationReport, BackupError> {
        cancel.check()?;
        let decryption = self.keys.import_key(source, local, path, cancel).await?;
        let path = path.to_path_buf();
        self.run_blocking(move |conn, _, hooks| {
            match validate_archive_file(&path, Some(&decryption.archive_key), decryption.header_len) {
                Ok(report) => Ok(report),
                Err(source) => {
                    if let Err(e) = hooks.presenter.present_validation_error(conn, &source) {
                        warn!(error = %e, "could not record validation error");
                    }
                    Err(BackupError::Validation { source })
                }
            }
        })
        .await
    }

    /// Validate an unencrypted archive.
    pub async fn validate_plaintext_backup(&self, path: &Path) -> Result<ValidationReport, BackupError> {
        let path = path.to_path_buf();
        self.run_blocking(move |_, _, _| Ok(validate_archive_file(&path, None, 0)?))
            .await
    }

    pub async fn backup_restore_state(&self) -> Result<BackupRestoreState, BackupError> {
        self.run_blocking(|conn, _, _| Ok(RestoreStateStore::new().get(conn)?))
            .await
    }

    /// Whether an import has run against this store, finalized or not.
    pub async fn has_restored_from_backup(&self) -> Result<bool, BackupError> {
        Ok(self.backup_restore_state().await? != BackupRestoreState::None)
    }

    /// Token of the last uploaded backup, or of the last committed import.
    pub async fn cached_forward_secrecy_token(
        &self,
    ) -> Result<Option<ForwardSecrecyToken>, BackupError> {
        let store = *self.keys.nonce_store();
        self.run_blocking(move |conn, _, _| Ok(store.last_forward_secrecy_token(conn)?))
            .await
    }

    pub async fn last_backup(&self) -> Result<Option<LastBackup>, BackupError> {
        self.run_blocking(|conn, _, _| Ok(BackupSettingsStore::new().last_backup(conn)?))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag(" TRUE "), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag(""), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn setters_replace_one_field() {
        let config = ManagerConfig::default()
            .strict_restore(true)
            .rate_limit_max_retries(0)
            .staging_dir("/tmp/staging")
            .app_version("9.9.9");
        assert!(config.strict_restore);
        assert_eq!(config.rate_limit_max_retries, 0);
        assert_eq!(config.staging_dir, PathBuf::from("/tmp/staging"));
        assert_eq!(config.app_version, "9.9.9");
    }
}

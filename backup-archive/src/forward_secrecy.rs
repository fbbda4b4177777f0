// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Forward-secrecy key derivation.
//!
//! Remote backups are encrypted with a key that mixes the long-term backup key with
//! a short-lived token held by the secret recovery service. Every export advances
//! the service's secret chain (store); every import recovers the token from the
//! metadata header at the start of the archive (restore).
//!
//! Failure handling:
//!
//! | service error | store (export) | restore (import) |
//! |---|---|---|
//! | connection | retry once with a fresh credential | same |
//! | rate limited | sleep and retry the same call | same |
//! | invalid argument | forget the chain seed, restart once | user-retryable |
//! | not found | [`KeyDerivationError::ChainNotFound`] | no token, new chain |
//! | anything else | user-retryable | user-retryable |
//!
//! Key derivation itself never writes chain state. Store returns a [`NonceRotation`]
//! which the caller commits after upload; restore returns a [`RestoredChain`] whose
//! seed the import persists and whose token is written with the import transaction.
//! Validation persists neither.

use std::{
    fmt,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use rusqlite::Connection;
use secret_recovery::{
    SecretRecoveryService, SvrError,
    types::{RestoreRequest, StoreRequest, SvrCredential},
};
use snafu::prelude::*;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::{
    cancel::CancellationToken,
    config::{
        HEADER_PREFIX_GUESS, NETWORK_MAX_ATTEMPTS, RATE_LIMIT_WAIT_MAX, RATE_LIMIT_WAIT_MIN,
        RATE_LIMIT_WAIT_WARN,
    },
    context::{BackupPurpose, LocalIdentifiers},
    crypto::{
        ArchiveKey, BackupId, BackupKey, EphemeralBackupKey, ForwardSecrecyToken,
        derive_archive_key, derive_backup_id, derive_device_transfer_key, derive_svr_password,
    },
    error::HeaderError,
    header::{HeaderParse, parse_header, serialize_header},
    nonce_store::NonceMetadataStore,
};

/// Errors deriving the archive encryption key.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum KeyDerivationError {
    /// The caller cancelled while waiting on the service.
    #[snafu(display("key derivation cancelled"))]
    Cancelled,

    /// Service failure the user may retry later.
    #[snafu(display("secret recovery service: {source}"))]
    UserRetryable { source: SvrError },

    /// Export requires an existing (or freshly created) secret chain, and the service has none.
    #[snafu(display("secret chain not found"))]
    ChainNotFound,

    /// Too many consecutive rate-limit responses.
    #[snafu(display("rate limit exceeded after {attempts} retries (last wait {}s)", retry_after.as_secs()))]
    RateLimitExceeded { attempts: u32, retry_after: Duration },

    /// Key material has the wrong shape.
    #[snafu(display("invalid key material: {message}"))]
    InvalidKeyMaterial { message: String },

    /// The archive's metadata header is missing or unreadable.
    #[snafu(display("invalid metadata header: {source}"))]
    InvalidMetadata { source: HeaderError },

    /// Reading the archive prefix failed.
    #[snafu(display("reading metadata header {path:?}: {source}"))]
    MetadataIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Reading or writing the nonce metadata store failed.
    #[snafu(display("nonce store: {source}"))]
    NonceStore { source: rusqlite::Error },

    /// The blocking task reading the nonce store panicked or was aborted.
    #[snafu(display("nonce store task: {source}"))]
    NonceStoreTask { source: tokio::task::JoinError },
}

/// Where the archive key comes from.
#[derive(Clone)]
pub enum KeySource {
    /// One-time key shared between two devices; no service round trip.
    DeviceTransfer { ephemeral: EphemeralBackupKey },
    /// Long-term backup key plus a forward-secrecy token. `cached_token` is a token
    /// handed over by another device; when present, import skips the restore call.
    RemoteBackup {
        backup_key: BackupKey,
        cached_token: Option<ForwardSecrecyToken>,
    },
}

impl KeySource {
    pub fn remote(backup_key: BackupKey) -> Self {
        Self::RemoteBackup {
            backup_key,
            cached_token: None,
        }
    }

    pub fn purpose(&self) -> BackupPurpose {
        match self {
            Self::DeviceTransfer { .. } => BackupPurpose::DeviceTransfer,
            Self::RemoteBackup { .. } => BackupPurpose::RemoteBackup,
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceTransfer { .. } => f.write_str("KeySource::DeviceTransfer"),
            Self::RemoteBackup { cached_token, .. } => f
                .debug_struct("KeySource::RemoteBackup")
                .field("cached_token", &cached_token.is_some())
                .finish_non_exhaustive(),
        }
    }
}

/// Chain state produced by a store call, committed once the upload succeeds.
#[derive(Clone, PartialEq, Eq)]
pub struct NonceRotation {
    pub forward_secrecy_token: ForwardSecrecyToken,
    pub next_secret_metadata: Vec<u8>,
}

impl NonceRotation {
    /// Persist the token and seed together. Call only after the archive it belongs
    /// to is uploaded.
    pub fn commit(&self, conn: &Connection, store: &NonceMetadataStore) -> rusqlite::Result<()> {
        let tx = conn.unchecked_transaction()?;
        store.set_last_forward_secrecy_token(&tx, &self.forward_secrecy_token)?;
        store.set_next_secret_metadata(&tx, &self.next_secret_metadata)?;
        tx.commit()
    }
}

impl fmt::Debug for NonceRotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonceRotation")
            .field("next_secret_metadata", &self.next_secret_metadata.len())
            .finish_non_exhaustive()
    }
}

/// Chain state returned by a restore call. Nothing is persisted by key derivation.
#[derive(Clone, PartialEq, Eq)]
pub struct RestoredChain {
    pub forward_secrecy_token: ForwardSecrecyToken,
    /// Seed for the next store call on this device.
    pub next_secret_metadata: Vec<u8>,
}

impl fmt::Debug for RestoredChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoredChain")
            .field("next_secret_metadata", &self.next_secret_metadata.len())
            .finish_non_exhaustive()
    }
}

/// Everything an export needs to encrypt its output.
pub struct EncryptionMetadata {
    pub archive_key: ArchiveKey,
    /// Set for remote backups.
    pub backup_id: Option<BackupId>,
    /// Serialized metadata header, prepended verbatim to the ciphertext.
    pub metadata_header: Option<Vec<u8>>,
    pub rotation: Option<NonceRotation>,
}

impl fmt::Debug for EncryptionMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionMetadata")
            .field("backup_id", &self.backup_id)
            .field("metadata_header", &self.metadata_header.as_ref().map(Vec::len))
            .field("rotation", &self.rotation)
            .finish_non_exhaustive()
    }
}

/// Everything an import needs to decrypt its input.
pub struct DecryptionMetadata {
    pub archive_key: ArchiveKey,
    /// Bytes of metadata header to skip before the ciphertext.
    pub header_len: u64,
    /// Set when the token came from a restore call rather than the caller.
    pub restored: Option<RestoredChain>,
}

impl fmt::Debug for DecryptionMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptionMetadata")
            .field("header_len", &self.header_len)
            .field("restored", &self.restored)
            .finish_non_exhaustive()
    }
}

/// Metadata header read from the start of an archive file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataHeader {
    pub body: Vec<u8>,
    /// Total header length, i.e. offset of the ciphertext.
    pub len: u64,
}

/// Read the metadata header from the start of `path`, fetching a larger prefix
/// as long as the parser asks for one.
pub async fn read_metadata_header(path: &Path) -> Result<MetadataHeader, KeyDerivationError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .context(MetadataIoSnafu { path })?;
    let mut buf = Vec::with_capacity(HEADER_PREFIX_GUESS);
    let mut want = HEADER_PREFIX_GUESS;
    loop {
        let missing = want.saturating_sub(buf.len()) as u64;
        (&mut file)
            .take(missing)
            .read_to_end(&mut buf)
            .await
            .context(MetadataIoSnafu { path })?;
        match parse_header(&buf).context(InvalidMetadataSnafu)? {
            HeaderParse::Complete { body, consumed } => {
                return Ok(MetadataHeader {
                    body: body.to_vec(),
                    len: consumed as u64,
                });
            }
            HeaderParse::NeedMoreBytes(needed) => {
                if buf.len() < want {
                    return Err(KeyDerivationError::InvalidMetadata {
                        source: HeaderError::HeaderTruncated {
                            needed,
                            available: buf.len(),
                        },
                    });
                }
                debug!(have = buf.len(), needed, "metadata header needs a longer prefix");
                want = needed;
            }
        }
    }
}

/// Derives archive keys, talking to the secret recovery service for remote backups.
pub struct KeyDeriver<S> {
    svr: S,
    db: Arc<Mutex<Connection>>,
    nonce_store: NonceMetadataStore,
    max_rate_limit_retries: u32,
}

impl<S> fmt::Debug for KeyDeriver<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDeriver")
            .field("max_rate_limit_retries", &self.max_rate_limit_retries)
            .finish_non_exhaustive()
    }
}

impl<S: SecretRecoveryService> KeyDeriver<S> {
    pub fn new(
        svr: S,
        db: Arc<Mutex<Connection>>,
        nonce_store: NonceMetadataStore,
        max_rate_limit_retries: u32,
    ) -> Self {
        Self {
            svr,
            db,
            nonce_store,
            max_rate_limit_retries,
        }
    }

    pub fn nonce_store(&self) -> &NonceMetadataStore {
        &self.nonce_store
    }

    /// Run `f` against the nonce store on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, KeyDerivationError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &NonceMetadataStore) -> rusqlite::Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let store = self.nonce_store;
        tokio::task::spawn_blocking(move || {
            let conn = db.lock();
            f(&conn, &store)
        })
        .await
        .context(NonceStoreTaskSnafu)?
        .context(NonceStoreSnafu)
    }

    /// Key and header for a new export.
    pub async fn export_key(
        &self,
        source: &KeySource,
        local: &LocalIdentifiers,
        cancel: &CancellationToken,
    ) -> Result<EncryptionMetadata, KeyDerivationError> {
        let backup_key = match source {
            KeySource::DeviceTransfer { ephemeral } => {
                return Ok(EncryptionMetadata {
                    archive_key: derive_device_transfer_key(ephemeral, &local.aci)?,
                    backup_id: None,
                    metadata_header: None,
                    rotation: None,
                });
            }
            KeySource::RemoteBackup { backup_key, .. } => backup_key,
        };
        let backup_id = derive_backup_id(backup_key, &local.aci)?;
        let password = derive_svr_password(backup_key, &backup_id)?;

        let mut restarted = false;
        loop {
            let previous = self
                .with_conn(|conn, store| store.next_secret_metadata(conn))
                .await?;
            debug!(%backup_id, has_seed = previous.is_some(), "storing forward secrecy token");
            let request = StoreRequest {
                backup_id: backup_id.as_bytes().to_vec(),
                password: password.to_vec(),
                previous_secret_data: previous,
            };
            let svr = &self.svr;
            let result = self
                .call_with_retries(cancel, |credential| {
                    let request = request.clone();
                    async move { svr.store(&credential, request).await }
                })
                .await?;
            match result {
                Ok(response) => {
                    let token = ForwardSecrecyToken::from_bytes(&response.forward_secrecy_token)?;
                    let archive_key = derive_archive_key(backup_key, &backup_id, Some(&token))?;
                    let header = serialize_header(&response.metadata).context(InvalidMetadataSnafu)?;
                    return Ok(EncryptionMetadata {
                        archive_key,
                        backup_id: Some(backup_id),
                        metadata_header: Some(header),
                        rotation: Some(NonceRotation {
                            forward_secrecy_token: token,
                            next_secret_metadata: response.next_secret_data,
                        }),
                    });
                }
                Err(SvrError::InvalidArgument { message }) if !restarted => {
                    warn!(%message, "secret chain rejected; starting a new chain");
                    self.with_conn(|conn, store| store.delete_next_secret_metadata(conn))
                        .await?;
                    restarted = true;
                }
                Err(SvrError::NotFound) => return Err(KeyDerivationError::ChainNotFound),
                Err(source) => return Err(KeyDerivationError::UserRetryable { source }),
            }
        }
    }

    /// Key for importing or validating the archive at `path`. Writes nothing; a
    /// restored chain is returned for the caller to persist.
    pub async fn import_key(
        &self,
        source: &KeySource,
        local: &LocalIdentifiers,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<DecryptionMetadata, KeyDerivationError> {
        let (backup_key, cached_token) = match source {
            KeySource::DeviceTransfer { ephemeral } => {
                return Ok(DecryptionMetadata {
                    archive_key: derive_device_transfer_key(ephemeral, &local.aci)?,
                    header_len: 0,
                    restored: None,
                });
            }
            KeySource::RemoteBackup {
                backup_key,
                cached_token,
            } => (backup_key, cached_token),
        };
        let backup_id = derive_backup_id(backup_key, &local.aci)?;
        let header = read_metadata_header(path).await?;

        let (token, restored) = match cached_token {
            Some(token) => {
                debug!(%backup_id, "using cached forward secrecy token");
                (Some(token.clone()), None)
            }
            None => {
                let restored = self.restore_chain(backup_key, &backup_id, header.body, cancel).await?;
                let token = restored.as_ref().map(|chain| chain.forward_secrecy_token.clone());
                (token, restored)
            }
        };
        Ok(DecryptionMetadata {
            archive_key: derive_archive_key(backup_key, &backup_id, token.as_ref())?,
            header_len: header.len,
            restored,
        })
    }

    async fn restore_chain(
        &self,
        backup_key: &BackupKey,
        backup_id: &BackupId,
        metadata: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<Option<RestoredChain>, KeyDerivationError> {
        let password = derive_svr_password(backup_key, backup_id)?;
        let request = RestoreRequest {
            backup_id: backup_id.as_bytes().to_vec(),
            password: password.to_vec(),
            metadata,
        };
        let svr = &self.svr;
        let result = self
            .call_with_retries(cancel, |credential| {
                let request = request.clone();
                async move { svr.restore(&credential, request).await }
            })
            .await?;
        match result {
            Ok(response) => {
                let token = ForwardSecrecyToken::from_bytes(&response.forward_secrecy_token)?;
                info!(%backup_id, "forward secrecy token restored");
                Ok(Some(RestoredChain {
                    forward_secrecy_token: token,
                    next_secret_metadata: response.next_secret_data,
                }))
            }
            Err(SvrError::NotFound) => {
                info!(%backup_id, "no secret chain on the service; deriving key without token");
                Ok(None)
            }
            Err(source) => Err(KeyDerivationError::UserRetryable { source }),
        }
    }

    /// Run one service call with connection retries and rate-limit waits.
    ///
    /// The outer `Err` ends the operation (cancelled, rate limit exhausted); the inner
    /// result is the service's answer for the caller to classify.
    async fn call_with_retries<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<Result<T, SvrError>, KeyDerivationError>
    where
        F: FnMut(SvrCredential) -> Fut,
        Fut: Future<Output = Result<T, SvrError>>,
    {
        let mut attempt = 0;
        'network: loop {
            attempt += 1;
            let last_attempt = attempt >= NETWORK_MAX_ATTEMPTS;
            if cancel.is_cancelled() {
                return Err(KeyDerivationError::Cancelled);
            }
            let credential = match self.svr.credential(attempt > 1).await {
                Ok(credential) => credential,
                Err(e) if e.is_connection() && !last_attempt => {
                    warn!(attempt, error = %e, "credential fetch failed; retrying");
                    continue 'network;
                }
                Err(e) => return Ok(Err(e)),
            };

            let mut rate_limited: u32 = 0;
            loop {
                if cancel.is_cancelled() {
                    return Err(KeyDerivationError::Cancelled);
                }
                match call(credential.clone()).await {
                    Err(SvrError::RateLimited { retry_after }) => {
                        rate_limited += 1;
                        let capped = self.max_rate_limit_retries > 0
                            && rate_limited > self.max_rate_limit_retries;
                        if capped {
                            return Err(KeyDerivationError::RateLimitExceeded {
                                attempts: rate_limited,
                                retry_after,
                            });
                        }
                        let wait = rate_limit_wait(retry_after);
                        if wait > RATE_LIMIT_WAIT_WARN {
                            warn!(
                                requested_secs = retry_after.as_secs(),
                                secs = wait.as_secs(),
                                "long rate-limit wait"
                            );
                        } else {
                            debug!(ms = wait.as_millis(), "rate limited; waiting");
                        }
                        tokio::select! {
                            () = tokio::time::sleep(wait) => {}
                            () = cancel.cancelled() => return Err(KeyDerivationError::Cancelled),
                        }
                    }
                    Err(e) if e.is_connection() && !last_attempt => {
                        warn!(attempt, error = %e, "service call failed; retrying with fresh credential");
                        continue 'network;
                    }
                    result => return Ok(result),
                }
            }
        }
    }
}

/// Sleep before retrying a rate-limited call: the server interval, kept within
/// [`RATE_LIMIT_WAIT_MIN`, `RATE_LIMIT_WAIT_MAX`].
fn rate_limit_wait(retry_after: Duration) -> Duration {
    retry_after.clamp(RATE_LIMIT_WAIT_MIN, RATE_LIMIT_WAIT_MAX)
}

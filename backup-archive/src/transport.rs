// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Moving archive files to and from backup storage.

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;
use snafu::prelude::*;
use tracing::{debug, info};

use crate::{
    crypto::BackupId,
    error::{TransportError, TransportIoSnafu},
};

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub backup_id: String,
    /// Where the archive now lives, in transport-specific form.
    pub location: String,
    pub len: u64,
}

/// Upload and download of archive files, keyed by backup id.
pub trait BackupTransport: Send + Sync {
    fn upload(
        &self,
        path: &Path,
        backup_id: &BackupId,
    ) -> impl Future<Output = Result<UploadReceipt, TransportError>> + Send;

    /// Download the archive for `backup_id` into `dest_dir`; returns the file path.
    fn download(
        &self,
        backup_id: &BackupId,
        dest_dir: &Path,
    ) -> impl Future<Output = Result<PathBuf, TransportError>> + Send;
}

impl<T: BackupTransport> BackupTransport for Arc<T> {
    fn upload(
        &self,
        path: &Path,
        backup_id: &BackupId,
    ) -> impl Future<Output = Result<UploadReceipt, TransportError>> + Send {
        (**self).upload(path, backup_id)
    }

    fn download(
        &self,
        backup_id: &BackupId,
        dest_dir: &Path,
    ) -> impl Future<Output = Result<PathBuf, TransportError>> + Send {
        (**self).download(backup_id, dest_dir)
    }
}

/// Stores archives as `<backup-id-hex>.bin` in a local directory.
#[derive(Debug, Clone)]
pub struct LocalDirectoryTransport {
    root: PathBuf,
}

impl LocalDirectoryTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(backup_id: &BackupId) -> String {
        format!("{}.bin", backup_id.to_hex())
    }
}

impl BackupTransport for LocalDirectoryTransport {
    async fn upload(&self, path: &Path, backup_id: &BackupId) -> Result<UploadReceipt, TransportError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .context(TransportIoSnafu { path: &self.root })?;
        let target = self.root.join(Self::file_name(backup_id));
        // readers never see a partial archive
        let partial = target.with_extension("partial");
        let len = tokio::fs::copy(path, &partial)
            .await
            .context(TransportIoSnafu { path })?;
        tokio::fs::rename(&partial, &target)
            .await
            .context(TransportIoSnafu { path: &target })?;
        info!(%backup_id, len, target = %target.display(), "backup uploaded");
        Ok(UploadReceipt {
            backup_id: backup_id.to_hex(),
            location: target.display().to_string(),
            len,
        })
    }

    async fn download(&self, backup_id: &BackupId, dest_dir: &Path) -> Result<PathBuf, TransportError> {
        let source = self.root.join(Self::file_name(backup_id));
        if !tokio::fs::try_exists(&source)
            .await
            .context(TransportIoSnafu { path: &source })?
        {
            return Err(TransportError::BackupNotFound {
                backup_id: backup_id.to_hex(),
            });
        }
        tokio::fs::create_dir_all(dest_dir)
            .await
            .context(TransportIoSnafu { path: dest_dir })?;
        let target = dest_dir.join(Self::file_name(backup_id));
        let len = tokio::fs::copy(&source, &target)
            .await
            .context(TransportIoSnafu { path: &source })?;
        debug!(%backup_id, len, "backup downloaded");
        Ok(target)
    }
}

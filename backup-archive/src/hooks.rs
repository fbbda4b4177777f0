// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Collaborators the pipelines call between frames: preparation before export,
//! deferred work after import, job scheduling and error presentation.
//!
//! [`PipelineHooks::noop`] does nothing and is enough for pipelines over a store
//! without attachments or search.

use std::sync::Arc;

use rusqlite::Connection;
use strum::{Display, IntoStaticStr};
use tracing::warn;

use crate::{
    cancel::CancellationToken,
    collapse::ErrorReport,
    context::{PostFrameRestoreAction, RestoringContext},
    error::{BackupError, ValidationError},
    frame_error::RestoreFrameError,
};

/// Which operation produced an error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum BackupOperation {
    Export,
    Import,
    Validate,
}

/// Work that must finish before an export snapshot is taken.
pub trait ArchivePreparation: Send + Sync {
    /// Bring pending attachment migrations to completion.
    fn run_attachment_migration(
        &self,
        conn: &Connection,
        cancel: &CancellationToken,
    ) -> Result<(), BackupError>;

    /// Move message bodies too large for a frame into attachments.
    fn stage_oversize_text(
        &self,
        conn: &Connection,
        cancel: &CancellationToken,
    ) -> Result<(), BackupError>;
}

/// Rough number of frames an export will write, for progress reporting.
pub trait FrameCountEstimator: Send + Sync {
    fn estimate_frame_count(&self, conn: &Connection) -> rusqlite::Result<u64>;
}

/// Runs queued [`PostFrameRestoreAction`]s once every frame has been read.
pub trait PostFrameActionHandler: Send + Sync {
    fn handle(
        &self,
        action: &PostFrameRestoreAction,
        ctx: &RestoringContext<'_>,
    ) -> Result<(), RestoreFrameError>;
}

/// Builds the thread search index synchronously at the end of an import.
pub trait ThreadIndexer: Send + Sync {
    /// Returns the number of threads indexed.
    fn index_threads(&self, conn: &Connection) -> rusqlite::Result<u64>;
}

/// Background jobs scheduled by import and finalize. Every method is idempotent.
pub trait RestoreJobQueue: Send + Sync {
    fn enqueue_message_indexing(&self, conn: &Connection) -> rusqlite::Result<()>;

    /// Returns the number of newly enqueued jobs.
    fn ensure_avatar_fetch(&self, conn: &Connection) -> rusqlite::Result<u64>;

    /// Returns the number of newly enqueued jobs.
    fn ensure_attachment_downloads(&self, conn: &Connection) -> rusqlite::Result<u64>;
}

/// Shows (or records) failures to the user.
pub trait ErrorPresenter: Send + Sync {
    fn present_report(
        &self,
        conn: &Connection,
        operation: BackupOperation,
        report: &ErrorReport,
    ) -> rusqlite::Result<()>;

    fn present_validation_error(
        &self,
        conn: &Connection,
        error: &ValidationError,
    ) -> rusqlite::Result<()>;
}

/// Every hook the pipelines call.
#[derive(Clone)]
pub struct PipelineHooks {
    pub preparation: Arc<dyn ArchivePreparation>,
    pub frame_estimator: Arc<dyn FrameCountEstimator>,
    pub post_frame: Arc<dyn PostFrameActionHandler>,
    pub thread_indexer: Arc<dyn ThreadIndexer>,
    pub jobs: Arc<dyn RestoreJobQueue>,
    pub presenter: Arc<dyn ErrorPresenter>,
}

impl std::fmt::Debug for PipelineHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHooks").finish_non_exhaustive()
    }
}

impl PipelineHooks {
    pub fn noop() -> Self {
        let noop = Arc::new(NoopHooks);
        Self {
            preparation: noop.clone(),
            frame_estimator: noop.clone(),
            post_frame: noop.clone(),
            thread_indexer: noop.clone(),
            jobs: noop.clone(),
            presenter: noop,
        }
    }

    /// Hand `report` to the presenter if it contains anything above a warning.
    pub fn present_report(&self, conn: &Connection, operation: BackupOperation, report: &ErrorReport) {
        if report.should_present()
            && let Err(e) = self.presenter.present_report(conn, operation, report)
        {
            warn!(%operation, error = %e, "could not record error report");
        }
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl ArchivePreparation for NoopHooks {
    fn run_attachment_migration(&self, _: &Connection, _: &CancellationToken) -> Result<(), BackupError> {
        Ok(())
    }

    fn stage_oversize_text(&self, _: &Connection, _: &CancellationToken) -> Result<(), BackupError> {
        Ok(())
    }
}

impl FrameCountEstimator for NoopHooks {
    fn estimate_frame_count(&self, _: &Connection) -> rusqlite::Result<u64> {
        Ok(0)
    }
}

impl PostFrameActionHandler for NoopHooks {
    fn handle(&self, _: &PostFrameRestoreAction, _: &RestoringContext<'_>) -> Result<(), RestoreFrameError> {
        Ok(())
    }
}

impl ThreadIndexer for NoopHooks {
    fn index_threads(&self, _: &Connection) -> rusqlite::Result<u64> {
        Ok(0)
    }
}

impl RestoreJobQueue for NoopHooks {
    fn enqueue_message_indexing(&self, _: &Connection) -> rusqlite::Result<()> {
        Ok(())
    }

    fn ensure_avatar_fetch(&self, _: &Connection) -> rusqlite::Result<u64> {
        Ok(0)
    }

    fn ensure_attachment_downloads(&self, _: &Connection) -> rusqlite::Result<u64> {
        Ok(0)
    }
}

impl ErrorPresenter for NoopHooks {
    fn present_report(&self, _: &Connection, _: BackupOperation, _: &ErrorReport) -> rusqlite::Result<()> {
        Ok(())
    }

    fn present_validation_error(&self, _: &Connection, _: &ValidationError) -> rusqlite::Result<()> {
        Ok(())
    }
}

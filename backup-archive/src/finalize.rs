// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Deferred work after an import: schedule avatar fetches and attachment
//! downloads, then mark the restore finalized.
//!
//! Every step is idempotent, so a finalize interrupted at any point can simply be
//! run again.

use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    cancel::CancellationToken,
    error::BackupError,
    hooks::PipelineHooks,
    restore_state::{BackupRestoreState, RestoreStateStore},
};

/// What a finalize call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FinalizeOutcome {
    /// The restore was already finalized; nothing was done.
    pub already_finalized: bool,
    pub avatar_jobs_enqueued: u64,
    pub attachment_jobs_enqueued: u64,
}

/// Finish a restore left `unfinalized` by the import pipeline.
///
/// Blocking; call from `spawn_blocking`.
pub fn finalize_backup_import(
    conn: &mut Connection,
    hooks: &PipelineHooks,
    cancel: &CancellationToken,
) -> Result<FinalizeOutcome, BackupError> {
    let state_store = RestoreStateStore::new();
    match state_store.get(conn)? {
        BackupRestoreState::None => return Err(BackupError::NotRestored),
        BackupRestoreState::Finalized => {
            debug!("restore already finalized");
            return Ok(FinalizeOutcome {
                already_finalized: true,
                ..FinalizeOutcome::default()
            });
        }
        BackupRestoreState::Unfinalized => {}
    }
    cancel.check()?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let avatar_jobs_enqueued = hooks.jobs.ensure_avatar_fetch(&tx)?;
    tx.commit()?;
    cancel.check()?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let attachment_jobs_enqueued = hooks.jobs.ensure_attachment_downloads(&tx)?;
    state_store.set(&tx, BackupRestoreState::Finalized)?;
    tx.commit()?;

    info!(avatar_jobs_enqueued, attachment_jobs_enqueued, "restore finalized");
    Ok(FinalizeOutcome {
        already_finalized: false,
        avatar_jobs_enqueued,
        attachment_jobs_enqueued,
    })
}

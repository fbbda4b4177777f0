// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Byte and progress accounting.
//!
//! - [`AttachmentByteCounter`] totals the size of attachments referenced by an export,
//!   counting each attachment once.
//! - [`ProgressTracker`] turns per-phase progress into an overall fraction using
//!   fixed phase weights and forwards it to an optional [`ProgressSink`].
//! - [`CountingReader`] counts bytes pulled from the archive file, which drives
//!   import progress.

use std::{
    collections::HashSet,
    fmt,
    io::{self, Read},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use strum::Display;

/// Total size of attachments referenced by an archive.
#[derive(Debug, Default)]
pub struct AttachmentByteCounter {
    inner: Mutex<CounterState>,
}

#[derive(Debug, Default)]
struct CounterState {
    seen: HashSet<String>,
    total: u64,
}

impl AttachmentByteCounter {
    /// Count `bytes` for attachment `id` unless it was already counted.
    /// Returns true if the attachment was new.
    pub fn add_attachment(&self, id: &str, bytes: u64) -> bool {
        let mut state = self.inner.lock();
        if !state.seen.insert(id.to_string()) {
            return false;
        }
        state.total = state.total.saturating_add(bytes);
        true
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total
    }

    pub fn attachment_count(&self) -> usize {
        self.inner.lock().seen.len()
    }
}

// ============================================================================
// Progress
// ============================================================================

/// A weighted phase of an export or import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ProgressPhase {
    ExportMigration,
    ExportFrames,
    ImportMigration,
    ImportFrames,
    ImportRecreateIndexes,
    ImportFinalize,
}

impl ProgressPhase {
    /// Share of the overall operation, out of 100.
    pub fn weight(self) -> u64 {
        match self {
            Self::ExportMigration | Self::ImportMigration | Self::ImportFinalize => 5,
            Self::ExportFrames => 95,
            Self::ImportFrames => 78,
            Self::ImportRecreateIndexes => 12,
        }
    }

    pub const EXPORT: &'static [Self] = &[Self::ExportMigration, Self::ExportFrames];
    pub const IMPORT: &'static [Self] = &[
        Self::ImportMigration,
        Self::ImportFrames,
        Self::ImportRecreateIndexes,
        Self::ImportFinalize,
    ];
}

/// One progress report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub phase: ProgressPhase,
    pub completed: u64,
    pub total: u64,
    /// Overall completion, 0.0 to 1.0.
    pub overall: f64,
}

/// Receives progress reports. Implemented for closures.
pub trait ProgressSink: Send + Sync {
    fn update(&self, update: ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn update(&self, update: ProgressUpdate) {
        self(update);
    }
}

// reports closer together than this are coalesced
const MIN_REPORT_STEP: f64 = 0.001;

/// Tracks progress through an ordered list of weighted phases.
pub struct ProgressTracker {
    sink: Option<Arc<dyn ProgressSink>>,
    phases: &'static [ProgressPhase],
    total_weight: u64,
    completed_weight: u64,
    current: Option<(ProgressPhase, u64)>,
    last_reported: f64,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("phases", &self.phases)
            .field("completed_weight", &self.completed_weight)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    pub fn new(sink: Option<Arc<dyn ProgressSink>>, phases: &'static [ProgressPhase]) -> Self {
        Self {
            sink,
            phases,
            total_weight: phases.iter().map(|p| p.weight()).sum::<u64>().max(1),
            completed_weight: 0,
            current: None,
            last_reported: -1.0,
        }
    }

    pub fn export(sink: Option<Arc<dyn ProgressSink>>) -> Self {
        Self::new(sink, ProgressPhase::EXPORT)
    }

    pub fn import(sink: Option<Arc<dyn ProgressSink>>) -> Self {
        Self::new(sink, ProgressPhase::IMPORT)
    }

    /// Begin `phase` with `total` units of work. Completes the previous phase.
    pub fn start_phase(&mut self, phase: ProgressPhase, total: u64) {
        self.finish_current();
        self.current = Some((phase, total));
        self.report(phase, 0, total);
    }

    /// Report `completed` units of the current phase.
    pub fn advance(&mut self, completed: u64) {
        if let Some((phase, total)) = self.current {
            self.report(phase, completed.min(total), total);
        }
    }

    /// Complete the current phase.
    pub fn complete_phase(&mut self) {
        if let Some((phase, total)) = self.current {
            self.finish_current();
            self.report_completed(phase, total);
        }
    }

    pub fn overall(&self) -> f64 {
        self.last_reported.max(0.0)
    }

    fn finish_current(&mut self) {
        if let Some((phase, _)) = self.current.take()
            && self.phases.contains(&phase)
        {
            self.completed_weight += phase.weight();
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn report(&mut self, phase: ProgressPhase, completed: u64, total: u64) {
        let phase_fraction = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64
        };
        let done = self.completed_weight as f64 + phase.weight() as f64 * phase_fraction;
        let overall = (done / self.total_weight as f64).min(1.0);
        self.emit(phase, completed, total, overall, false);
    }

    #[allow(clippy::cast_precision_loss)]
    fn report_completed(&mut self, phase: ProgressPhase, total: u64) {
        let overall = (self.completed_weight as f64 / self.total_weight as f64).min(1.0);
        self.emit(phase, total, total, overall, true);
    }

    fn emit(&mut self, phase: ProgressPhase, completed: u64, total: u64, overall: f64, force: bool) {
        if !force && overall - self.last_reported < MIN_REPORT_STEP {
            return;
        }
        self.last_reported = overall;
        if let Some(sink) = &self.sink {
            sink.update(ProgressUpdate {
                phase,
                completed,
                total,
                overall,
            });
        }
    }
}

/// Reader that counts the bytes read through it.
#[derive(Debug)]
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared handle to the byte count, readable while the reader is borrowed.
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.count)
    }

    pub fn bytes_read(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_counter_dedupes_by_id() {
        let counter = AttachmentByteCounter::default();
        assert!(counter.add_attachment("a", 100));
        assert!(counter.add_attachment("b", 50));
        assert!(!counter.add_attachment("a", 100));
        assert_eq!(counter.total_bytes(), 150);
        assert_eq!(counter.attachment_count(), 2);
    }

    #[test]
    fn weights_sum_to_one_hundred() {
        let export: u64 = ProgressPhase::EXPORT.iter().map(|p| p.weight()).sum();
        let import: u64 = ProgressPhase::IMPORT.iter().map(|p| p.weight()).sum();
        assert_eq!(export, 100);
        assert_eq!(import, 100);
    }

    #[test]
    fn tracker_reports_weighted_monotonic_progress() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: Arc<dyn ProgressSink> =
            Arc::new(move |u: ProgressUpdate| sink_seen.lock().push(u.overall));
        let mut tracker = ProgressTracker::import(Some(sink));
        tracker.start_phase(ProgressPhase::ImportMigration, 1);
        tracker.complete_phase();
        tracker.start_phase(ProgressPhase::ImportFrames, 100);
        tracker.advance(50);
        tracker.complete_phase();
        tracker.start_phase(ProgressPhase::ImportRecreateIndexes, 1);
        tracker.complete_phase();
        tracker.start_phase(ProgressPhase::ImportFinalize, 1);
        tracker.complete_phase();

        let seen = seen.lock();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert!(seen.iter().any(|v| (v - 0.44).abs() < 1e-9), "{seen:?}");
        assert!((seen.last().copied().unwrap_or_default() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn counting_reader_counts() {
        let mut reader = CountingReader::new(&b"hello world"[..]);
        let counter = reader.counter();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).expect("read");
        assert_eq!(counter.load(Ordering::Relaxed), 4);
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).expect("read");
        assert_eq!(reader.bytes_read(), 11);
    }
}

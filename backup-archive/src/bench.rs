// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Timing of exports and imports, per frame kind and per pipeline step.

use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::proto::FrameKind;

/// Accumulated timings for one frame kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameMetrics {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl FrameMetrics {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
    }

    pub fn average(&self) -> Duration {
        u32::try_from(self.count)
            .ok()
            .filter(|n| *n > 0)
            .map_or(Duration::ZERO, |n| self.total / n)
    }
}

/// Records how long frames and steps take. Shared by reference through the
/// archiving and restoring contexts.
#[derive(Debug)]
pub struct Bencher {
    started: Instant,
    state: Mutex<BenchState>,
}

#[derive(Debug, Default)]
struct BenchState {
    frames: BTreeMap<FrameKind, FrameMetrics>,
    steps: Vec<(String, Duration)>,
}

impl Default for Bencher {
    fn default() -> Self {
        Self::new()
    }
}

impl Bencher {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            state: Mutex::new(BenchState::default()),
        }
    }

    /// Run `f`, recording its duration against `kind`.
    pub fn measure_frame<T>(&self, kind: FrameKind, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record_frame(kind, start.elapsed());
        out
    }

    pub fn record_frame(&self, kind: FrameKind, elapsed: Duration) {
        self.state.lock().frames.entry(kind).or_default().record(elapsed);
    }

    /// Run a named pipeline step and record its duration.
    pub fn measure_step<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.state
            .lock()
            .steps
            .push((name.to_string(), start.elapsed()));
        out
    }

    pub fn summary(&self) -> BenchSummary {
        let state = self.state.lock();
        BenchSummary {
            elapsed: self.started.elapsed(),
            frames: state.frames.clone(),
            steps: state.steps.clone(),
        }
    }

    /// Log the summary at info level.
    pub fn log_results(&self, title: &str) {
        let summary = self.summary();
        info!(
            title,
            elapsed_ms = summary.elapsed.as_millis(),
            frames = summary.frame_count(),
            "benchmark"
        );
        for (kind, metrics) in &summary.frames {
            info!(
                title,
                %kind,
                count = metrics.count,
                avg_us = metrics.average().as_micros(),
                max_us = metrics.max.as_micros(),
                "frame timing"
            );
        }
    }
}

/// Snapshot of a [`Bencher`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct BenchSummary {
    pub elapsed: Duration,
    pub frames: BTreeMap<FrameKind, FrameMetrics>,
    pub steps: Vec<(String, Duration)>,
}

impl BenchSummary {
    pub fn frame_count(&self) -> u64 {
        self.frames.values().map(|m| m.count).sum()
    }
}

impl fmt::Display for BenchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} frames in {:.3}s",
            self.frame_count(),
            self.elapsed.as_secs_f64()
        )?;
        for (kind, m) in &self.frames {
            writeln!(
                f,
                "  {kind:<22} {:>8}  avg {:>6}us  max {:>6}us",
                m.count,
                m.average().as_micros(),
                m.max.as_micros()
            )?;
        }
        for (name, elapsed) in &self.steps {
            writeln!(f, "  step {name:<22} {:>8}ms", elapsed.as_millis())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_grouped_by_kind() {
        let bencher = Bencher::new();
        bencher.record_frame(FrameKind::ChatItem, Duration::from_micros(10));
        bencher.record_frame(FrameKind::ChatItem, Duration::from_micros(30));
        let value = bencher.measure_frame(FrameKind::Chat, || 7);
        assert_eq!(value, 7);
        bencher.measure_step("recreate indexes", || ());

        let summary = bencher.summary();
        assert_eq!(summary.frame_count(), 3);
        let items = summary.frames[&FrameKind::ChatItem];
        assert_eq!(items.count, 2);
        assert_eq!(items.average(), Duration::from_micros(20));
        assert_eq!(items.max, Duration::from_micros(30));
        assert_eq!(summary.steps.len(), 1);
        assert!(summary.to_string().contains("chat_item"));
    }
}

// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Collapsing and reporting of recorded frame errors.
//!
//! A large archive can produce thousands of identical errors (one missing recipient
//! referenced by every message of a chat). They are grouped by collapse key and
//! severity, in order of first appearance, and logged once with a count and a few
//! example ids.

use std::{collections::HashMap, fmt};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::{
    config::{DROPPED_FRAME_MARKER, MAX_COLLAPSED_ID_LOG_COUNT},
    frame_error::{FrameErrorRecord, LogLevel, LoggableError},
};

/// One log entry standing for one or more errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollapsedErrorLog {
    pub type_log_string: String,
    pub example_callsite: String,
    pub count: usize,
    /// At most `MAX_COLLAPSED_ID_LOG_COUNT` ids, first seen first.
    pub ids: Vec<String>,
    #[serde(serialize_with = "serialize_level")]
    pub level: LogLevel,
    #[serde(skip)]
    collapsed: bool,
}

fn serialize_level<S: serde::Serializer>(level: &LogLevel, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(level)
}

impl CollapsedErrorLog {
    fn new(error: &dyn LoggableError, collapsed: bool) -> Self {
        let id = error.id_log_string();
        Self {
            type_log_string: error.type_log_string(),
            example_callsite: error.callsite_log_string(),
            count: 1,
            ids: if id.is_empty() { Vec::new() } else { vec![id] },
            level: error.log_level(),
            collapsed,
        }
    }

    fn add(&mut self, error: &dyn LoggableError) {
        self.count += 1;
        if self.ids.len() < MAX_COLLAPSED_ID_LOG_COUNT {
            let id = error.id_log_string();
            if !id.is_empty() {
                self.ids.push(id);
            }
        }
    }

    /// Emit this entry through `tracing` at its level.
    pub fn log(&self) {
        match self.level {
            LogLevel::Error => error!(target: "backup", "{self}"),
            LogLevel::Warning => warn!(target: "backup", "{self}"),
            LogLevel::Verbose => debug!(target: "backup", "{self}"),
        }
    }
}

impl fmt::Display for CollapsedErrorLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.collapsed {
            write!(
                f,
                "{} Repeated {} times. from: [{}] example callsite: {}",
                self.type_log_string,
                self.count,
                self.ids.join(", "),
                self.example_callsite
            )
        } else {
            write!(
                f,
                "{} {} {}",
                self.type_log_string,
                self.ids.join(", "),
                self.example_callsite
            )
        }
    }
}

/// Group errors by `(collapse key, level)`, preserving first-appearance order.
/// Errors without a collapse key get an entry each.
pub fn collapse(errors: &[FrameErrorRecord]) -> Vec<CollapsedErrorLog> {
    let mut entries: Vec<CollapsedErrorLog> = Vec::new();
    let mut buckets: HashMap<(String, LogLevel), usize> = HashMap::new();
    for record in errors {
        let error = &record.error;
        match error.collapse_key() {
            Some(key) => {
                let level = error.log_level();
                if let Some(&index) = buckets.get(&(key.clone(), level)) {
                    entries[index].add(error);
                } else {
                    buckets.insert((key, level), entries.len());
                    entries.push(CollapsedErrorLog::new(error, true));
                }
            }
            None => entries.push(CollapsedErrorLog::new(error, false)),
        }
    }
    entries
}

/// Outcome of [`process_errors`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub entries: Vec<CollapsedErrorLog>,
    #[serde(serialize_with = "serialize_max_level")]
    pub max_level: Option<LogLevel>,
    pub dropped_frames: bool,
    pub error_count: usize,
}

fn serialize_max_level<S: serde::Serializer>(
    level: &Option<LogLevel>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match level {
        Some(level) => s.collect_str(level),
        None => s.serialize_none(),
    }
}

impl ErrorReport {
    pub fn is_empty(&self) -> bool {
        self.error_count == 0
    }

    /// True if the operation should be reported to the user as having errors.
    /// Warnings alone are not.
    pub fn should_present(&self) -> bool {
        self.max_level.is_some_and(|level| level > LogLevel::Warning)
    }
}

/// Collapse, log and summarize the errors of one operation.
pub fn process_errors(errors: &[FrameErrorRecord]) -> ErrorReport {
    if errors.is_empty() {
        return ErrorReport::default();
    }
    let entries = collapse(errors);
    for entry in &entries {
        entry.log();
    }
    let dropped_frames = errors.iter().any(|e| e.was_frame_dropped);
    if dropped_frames {
        error!(target: "backup", "{DROPPED_FRAME_MARKER}");
    }
    ErrorReport {
        max_level: entries.iter().map(|e| e.level).max(),
        entries,
        dropped_frames,
        error_count: errors.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_error::{
        FatalArchivingError, InvalidProtoDataError, LoggableId, RestoreFrameError,
        UnrecognizedEnumError,
    };

    fn missing_recipient(id: u64) -> FrameErrorRecord {
        FrameErrorRecord::new(
            RestoreFrameError::invalid(
                InvalidProtoDataError::RecipientIdNotFound(id),
                LoggableId::chat(id),
            ),
            true,
        )
    }

    #[test]
    fn identical_errors_collapse_with_capped_ids() {
        let errors: Vec<_> = (0..25).map(missing_recipient).collect();
        let entries = collapse(&errors);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].count, 25);
        assert_eq!(entries[0].ids.len(), MAX_COLLAPSED_ID_LOG_COUNT);
        assert_eq!(entries[0].ids[0], "Chat.0");
        assert!(entries[0].to_string().contains("Repeated 25 times"));
    }

    #[test]
    fn order_of_first_appearance_is_kept() {
        let errors = vec![
            missing_recipient(1),
            FrameErrorRecord::new(FatalArchivingError::new("first"), true),
            FrameErrorRecord::new(
                UnrecognizedEnumError::new("Direction", 7, LoggableId::chat_item(1, 1)),
                true,
            ),
            missing_recipient(2),
            FrameErrorRecord::new(FatalArchivingError::new("second"), true),
        ];
        let entries = collapse(&errors);
        let types: Vec<_> = entries.iter().map(|e| e.type_log_string.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "RestoreFrameError: invalidProtoData.recipientIdNotFound",
                "FatalArchiveError: first",
                "UnrecognizedEnum: Direction",
                "FatalArchiveError: second",
            ]
        );
        assert_eq!(entries[0].count, 2);
        assert!(entries[0].ids.contains(&"Chat.2".to_string()));
    }

    #[test_log::test]
    fn warnings_alone_are_not_presented() {
        let warning = FrameErrorRecord::new(
            UnrecognizedEnumError::new("Direction", 7, LoggableId::chat_item(1, 1)),
            true,
        );
        let report = process_errors(&[warning]);
        assert_eq!(report.max_level, Some(LogLevel::Warning));
        assert!(!report.should_present());
        assert!(report.dropped_frames);

        let report = process_errors(&[missing_recipient(3)]);
        assert!(report.should_present());
    }

    #[test]
    fn empty_report() {
        let report = process_errors(&[]);
        assert!(report.is_empty());
        assert!(!report.should_present());
        assert!(!report.dropped_frames);
    }
}

// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Which content goes into an archive.

use crate::context::BackupPurpose;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Content rules for one export, derived from the backup purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncludedContentFilter {
    /// Disappearing messages with a shorter timer are left out.
    pub min_expire_timer_ms: u64,
    /// Disappearing messages that expire sooner than this are left out.
    pub min_time_until_expiration_ms: u64,
    /// Unviewed view-once messages are exported without their attachment.
    pub tombstone_unviewed_view_once: bool,
}

impl IncludedContentFilter {
    pub fn for_purpose(purpose: BackupPurpose) -> Self {
        match purpose {
            BackupPurpose::DeviceTransfer => Self {
                min_expire_timer_ms: 0,
                min_time_until_expiration_ms: 0,
                tombstone_unviewed_view_once: false,
            },
            BackupPurpose::RemoteBackup => Self {
                min_expire_timer_ms: DAY_MS,
                min_time_until_expiration_ms: DAY_MS,
                tombstone_unviewed_view_once: true,
            },
        }
    }

    /// Whether a message with the given expiry settings is exported at `now_ms`.
    ///
    /// Messages without a timer are always exported. A message whose countdown has
    /// started is left out once it expires within `min_time_until_expiration_ms`
    /// (already expired messages are always left out).
    pub fn should_include_message(
        &self,
        expires_in_ms: Option<u64>,
        expire_start_ms: Option<u64>,
        now_ms: u64,
    ) -> bool {
        let Some(expires_in) = expires_in_ms.filter(|ms| *ms > 0) else {
            return true;
        };
        if expires_in < self.min_expire_timer_ms {
            return false;
        }
        match expire_start_ms {
            Some(start) => {
                let expires_at = start.saturating_add(expires_in);
                expires_at > now_ms.saturating_add(self.min_time_until_expiration_ms)
            }
            None => true,
        }
    }

    /// Whether a view-once message is exported without its attachment.
    pub fn should_tombstone_view_once(&self, viewed: bool) -> bool {
        self.tombstone_unviewed_view_once && !viewed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    #[test]
    fn device_transfer_keeps_everything_not_yet_expired() {
        let filter = IncludedContentFilter::for_purpose(BackupPurpose::DeviceTransfer);
        assert!(filter.should_include_message(Some(5_000), None, NOW));
        assert!(filter.should_include_message(Some(5_000), Some(NOW - 1_000), NOW));
        assert!(!filter.should_include_message(Some(5_000), Some(NOW - 10_000), NOW));
        assert!(!filter.should_tombstone_view_once(false));
    }

    #[test]
    fn remote_backup_drops_short_lived_messages() {
        let filter = IncludedContentFilter::for_purpose(BackupPurpose::RemoteBackup);
        assert!(filter.should_include_message(None, None, NOW));
        assert!(filter.should_include_message(Some(0), Some(NOW), NOW));
        // timer under a day
        assert!(!filter.should_include_message(Some(DAY_MS - 1), None, NOW));
        // expires within a day
        assert!(!filter.should_include_message(Some(2 * DAY_MS), Some(NOW - DAY_MS - 1), NOW));
        assert!(filter.should_include_message(Some(2 * DAY_MS), Some(NOW - 1_000), NOW));
        assert!(filter.should_tombstone_view_once(false));
        assert!(!filter.should_tombstone_view_once(true));
    }
}

//! History retention policy.

use super::types::HistoryEntry;

/// Hard cap on stored history entries for backends without expiry.
pub const MAX_HISTORY_ENTRIES: usize = 1000;

pub const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// How a backend bounds the size of the history document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryBound {
    /// Keep at most this many of the newest entries after the age filter.
    Capped(usize),
    /// The stored document expires after the retention window; no count cap.
    Expiring,
}

impl HistoryBound {
    pub fn cap(&self) -> Option<usize> {
        match self {
            HistoryBound::Capped(max) => Some(*max),
            HistoryBound::Expiring => None,
        }
    }
}

/// Oldest timestamp (exclusive) that survives a retention of `days`.
pub fn cutoff(now_ms: i64, days: u32) -> i64 {
    now_ms - i64::from(days) * MS_PER_DAY
}

/// Drop entries at or before the cutoff, then keep only the newest `cap`.
///
/// The age filter always runs first so the cap discards the oldest survivors.
pub fn apply_retention(
    entries: Vec<HistoryEntry>,
    days: u32,
    now_ms: i64,
    cap: Option<usize>,
) -> Vec<HistoryEntry> {
    let cutoff = cutoff(now_ms, days);
    let mut retained: Vec<HistoryEntry> = entries
        .into_iter()
        .filter(|entry| entry.timestamp > cutoff)
        .collect();

    if let Some(max) = cap {
        if retained.len() > max {
            let excess = retained.len() - max;
            retained.drain(..excess);
        }
    }
    retained
}

/// Expiry for the history document, in seconds.
pub fn history_ttl_secs(days: u32) -> u64 {
    u64::from(days) * 24 * 60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_760_000_000_000;

    fn entries(timestamps: &[i64]) -> Vec<HistoryEntry> {
        timestamps.iter().map(|t| HistoryEntry::at(*t)).collect()
    }

    #[test]
    fn drops_entries_older_than_retention() {
        let kept = apply_retention(
            entries(&[NOW - 40 * MS_PER_DAY, NOW - MS_PER_DAY]),
            30,
            NOW,
            Some(MAX_HISTORY_ENTRIES),
        );
        assert_eq!(kept, entries(&[NOW - MS_PER_DAY]));
    }

    #[test]
    fn entry_exactly_at_cutoff_is_dropped() {
        let kept = apply_retention(
            entries(&[NOW - 30 * MS_PER_DAY, NOW - 30 * MS_PER_DAY + 1]),
            30,
            NOW,
            None,
        );
        assert_eq!(kept, entries(&[NOW - 30 * MS_PER_DAY + 1]));
    }

    #[test]
    fn cap_keeps_newest_survivors() {
        let timestamps: Vec<i64> = (0..1500).map(|i| NOW - 1500 + i).collect();
        let kept = apply_retention(entries(&timestamps), 30, NOW, Some(1000));
        assert_eq!(kept.len(), 1000);
        assert_eq!(kept.first().unwrap().timestamp, NOW - 1000);
        assert_eq!(kept.last().unwrap().timestamp, NOW - 1);
    }

    #[test]
    fn age_filter_runs_before_cap() {
        // 5 stale entries followed by 3 fresh ones, capped at 4: the cap must
        // not spend any of its budget on stale entries.
        let mut timestamps: Vec<i64> = (0..5).map(|i| NOW - 60 * MS_PER_DAY + i).collect();
        timestamps.extend([NOW - 3, NOW - 2, NOW - 1]);
        let kept = apply_retention(entries(&timestamps), 30, NOW, Some(4));
        assert_eq!(kept, entries(&[NOW - 3, NOW - 2, NOW - 1]));
    }

    #[test]
    fn expiring_backends_are_not_capped() {
        let timestamps: Vec<i64> = (0..1200).map(|i| NOW - 1200 + i).collect();
        let kept = apply_retention(entries(&timestamps), 30, NOW, HistoryBound::Expiring.cap());
        assert_eq!(kept.len(), 1200);
    }

    #[test]
    fn ttl_matches_retention_window() {
        assert_eq!(history_ttl_secs(30), 2_592_000);
        assert_eq!(history_ttl_secs(1), 86_400);
    }
}

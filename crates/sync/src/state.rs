//! Per-session progress as a tagged state with an explicit transition function.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Init,
    InProgress,
    Completed,
    ResourceNameChanged,
    TotalSizeChanged,
    FailedAndUntracked,
    ConcurrentFullSync,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::Init => "init",
            SyncPhase::InProgress => "in_progress",
            SyncPhase::Completed => "completed",
            SyncPhase::ResourceNameChanged => "resource_name_changed",
            SyncPhase::TotalSizeChanged => "total_size_changed",
            SyncPhase::FailedAndUntracked => "failed_and_untracked",
            SyncPhase::ConcurrentFullSync => "concurrent_full_sync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub resource: String,
    pub correlation_id: String,
    pub total_size: u64,
    pub processed: u64,
    /// Smallest event timestamp seen in the session.
    pub started_at: i64,
}

/// One event as seen by the state machine.
#[derive(Debug, Clone, Copy)]
pub struct SyncInput<'a> {
    pub resource: &'a str,
    pub correlation_id: &'a str,
    pub total_size: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Init,
    InProgress(SyncProgress),
    Completed(SyncProgress),
    ResourceNameChanged(SyncProgress),
    TotalSizeChanged(SyncProgress),
    FailedAndUntracked(SyncProgress),
    ConcurrentFullSync(SyncProgress),
}

impl SyncState {
    pub fn phase(&self) -> SyncPhase {
        match self {
            SyncState::Init => SyncPhase::Init,
            SyncState::InProgress(_) => SyncPhase::InProgress,
            SyncState::Completed(_) => SyncPhase::Completed,
            SyncState::ResourceNameChanged(_) => SyncPhase::ResourceNameChanged,
            SyncState::TotalSizeChanged(_) => SyncPhase::TotalSizeChanged,
            SyncState::FailedAndUntracked(_) => SyncPhase::FailedAndUntracked,
            SyncState::ConcurrentFullSync(_) => SyncPhase::ConcurrentFullSync,
        }
    }

    pub fn progress(&self) -> Option<&SyncProgress> {
        match self {
            SyncState::Init => None,
            SyncState::InProgress(p)
            | SyncState::Completed(p)
            | SyncState::ResourceNameChanged(p)
            | SyncState::TotalSizeChanged(p)
            | SyncState::FailedAndUntracked(p)
            | SyncState::ConcurrentFullSync(p) => Some(p),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            SyncState::ResourceNameChanged(_) | SyncState::TotalSizeChanged(_) | SyncState::FailedAndUntracked(_)
        )
    }

    /// Marks a session overtaken by a newer FULL run for the same resource.
    pub fn into_concurrent(self) -> SyncState {
        match self {
            SyncState::Init => SyncState::Init,
            other => match other.progress().cloned() {
                Some(p) => SyncState::ConcurrentFullSync(p),
                None => other,
            },
        }
    }

    pub fn next(self, input: SyncInput<'_>) -> SyncState {
        match self {
            SyncState::Init | SyncState::Completed(_) => {
                let p = SyncProgress {
                    resource: input.resource.to_string(),
                    correlation_id: input.correlation_id.to_string(),
                    total_size: input.total_size,
                    processed: 1,
                    started_at: input.timestamp,
                };
                if p.processed >= p.total_size {
                    SyncState::Completed(p)
                } else {
                    SyncState::InProgress(p)
                }
            }
            SyncState::InProgress(mut p) => {
                p.processed += 1;
                p.started_at = p.started_at.min(input.timestamp);
                if p.resource != input.resource {
                    SyncState::ResourceNameChanged(p)
                } else if p.total_size != input.total_size {
                    SyncState::TotalSizeChanged(p)
                } else if p.processed >= p.total_size {
                    SyncState::Completed(p)
                } else {
                    SyncState::InProgress(p)
                }
            }
            SyncState::ResourceNameChanged(mut p) | SyncState::TotalSizeChanged(mut p) | SyncState::FailedAndUntracked(mut p) => {
                p.processed += 1;
                SyncState::FailedAndUntracked(p)
            }
            SyncState::ConcurrentFullSync(mut p) => {
                p.processed += 1;
                SyncState::ConcurrentFullSync(p)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(resource: &str, total_size: u64, timestamp: i64) -> SyncInput<'_> {
        SyncInput { resource, correlation_id: "c1", total_size, timestamp }
    }

    #[test]
    fn single_event_session_completes_immediately() {
        let s = SyncState::Init.next(input("student", 1, 5));
        assert_eq!(s.phase(), SyncPhase::Completed);
    }

    #[test]
    fn counts_to_total_and_tracks_earliest_timestamp() {
        let s = SyncState::Init.next(input("student", 3, 20));
        assert_eq!(s.phase(), SyncPhase::InProgress);
        let s = s.next(input("student", 3, 10));
        assert_eq!(s.phase(), SyncPhase::InProgress);
        let s = s.next(input("student", 3, 30));
        assert_eq!(s.phase(), SyncPhase::Completed);
        assert_eq!(s.progress().unwrap().started_at, 10);
        assert_eq!(s.progress().unwrap().processed, 3);
    }

    #[test]
    fn mismatches_fail_and_stay_failed() {
        let s = SyncState::Init.next(input("student", 3, 1)).next(input("class", 3, 2));
        assert_eq!(s.phase(), SyncPhase::ResourceNameChanged);
        let s = s.next(input("student", 3, 3));
        assert_eq!(s.phase(), SyncPhase::FailedAndUntracked);
        assert_eq!(s.progress().unwrap().processed, 3);

        let s = SyncState::Init.next(input("student", 3, 1)).next(input("student", 4, 2));
        assert_eq!(s.phase(), SyncPhase::TotalSizeChanged);
        assert!(s.next(input("student", 3, 3)).is_failed());
    }

    #[test]
    fn concurrent_full_sync_is_absorbing() {
        let s = SyncState::Init.next(input("student", 3, 1)).into_concurrent();
        assert_eq!(s.phase(), SyncPhase::ConcurrentFullSync);
        assert_eq!(s.next(input("student", 3, 2)).phase(), SyncPhase::ConcurrentFullSync);
    }
}

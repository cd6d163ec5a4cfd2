//! Timer-driven refresh of scheduled resources.
//!
//! A single task owns the timer. It arms itself for the head of the
//! storage's refresh queue, with a five second floor when the head is
//! already overdue and a 24 hour fallback when nothing is scheduled. Any
//! mutation nudges the task through the `Notify` handle so it re-arms
//! against the fresh queue; at most one timer is pending at any time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::storage::Storage;

const REFRESH_FLOOR: Duration = Duration::from_secs(5);
const IDLE_RESCAN: Duration = Duration::from_secs(24 * 60 * 60);

/// How long to sleep until the next refresh is due. Overdue entries are
/// clamped to the floor so a backlog cannot busy-loop the daemon.
fn arm_duration(due: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    match due {
        None => IDLE_RESCAN,
        Some(due) => (due - now).to_std().unwrap_or(Duration::ZERO).max(REFRESH_FLOOR),
    }
}

pub async fn run(storage: Arc<Mutex<Storage>>, notify: Arc<Notify>) {
    loop {
        let wait = {
            let storage = storage.lock().await;
            match storage.next_refresh() {
                None => {
                    debug!("nothing found to refresh, looking again in 24h");
                    arm_duration(None, Utc::now())
                }
                Some(entry) => {
                    let wait = arm_duration(Some(entry.due), Utc::now());
                    info!("next refresh planned for '{}' in {:?}", entry.name, wait);
                    wait
                }
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                let mut storage = storage.lock().await;
                storage.run_due_refresh();
            }
            // The graph changed; re-arm against the new queue head.
            _ = notify.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn overdue_entries_keep_the_floor() {
        let now = Utc::now();
        let past = now - ChronoDuration::hours(1);
        assert_eq!(arm_duration(Some(past), now), REFRESH_FLOOR);
        assert_eq!(arm_duration(Some(now), now), REFRESH_FLOOR);
    }

    #[test]
    fn near_future_entries_keep_the_floor() {
        let now = Utc::now();
        let soon = now + ChronoDuration::seconds(2);
        assert_eq!(arm_duration(Some(soon), now), REFRESH_FLOOR);
    }

    #[test]
    fn far_entries_wait_until_due() {
        let now = Utc::now();
        let later = now + ChronoDuration::seconds(600);
        let wait = arm_duration(Some(later), now);
        assert!(wait > Duration::from_secs(595) && wait <= Duration::from_secs(600));
    }

    #[test]
    fn empty_queue_rescans_daily() {
        assert_eq!(arm_duration(None, Utc::now()), IDLE_RESCAN);
    }
}

//! Startup reconciliation.
//!
//! Timers are process-local, so a restart loses every armed handle. On boot
//! the manager walks all communities: schedules already in the past get a
//! fresh time and reward (the missed one is never replayed), schedules still
//! in the future are re-armed exactly as persisted. One broken record never
//! aborts the scan.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::logging::{self, obj, v_int, v_str, Domain};
use crate::profile::{CommunityId, CommunityProfile, TimeAndSoul};
use crate::scheduler::{DriveOptions, Scheduler};
use crate::souls::SoulCatalog;
use crate::store::ProfileStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Future schedules re-armed as persisted.
    pub resumed: usize,
    /// Missed schedules replaced with a fresh draw.
    pub redrawn: usize,
    /// Records that could not be read or driven.
    pub failed: usize,
}

pub struct RecoveryManager {
    store: Arc<dyn ProfileStore>,
    scheduler: Scheduler,
    catalog: Arc<SoulCatalog>,
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn ProfileStore>, scheduler: Scheduler, catalog: Arc<SoulCatalog>) -> Self {
        Self { store, scheduler, catalog }
    }

    pub async fn reconcile_all(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let records = match self.store.stream_all().await {
            Ok(records) => records,
            Err(err) => {
                logging::error(
                    Domain::Recovery,
                    "scan_failed",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                report.failed += 1;
                return report;
            }
        };

        for record in records {
            let profile = match record {
                Ok(profile) => profile,
                Err(err) => {
                    logging::warn(
                        Domain::Recovery,
                        "record_unreadable",
                        obj(&[("error", v_str(&err.to_string()))]),
                    );
                    report.failed += 1;
                    continue;
                }
            };
            let now = Utc::now();
            if profile.schedule.next.time <= now {
                logging::info(
                    Domain::Recovery,
                    "missed_while_down",
                    obj(&[
                        ("community", v_str(&profile.community_id)),
                        ("was_due", v_str(&profile.schedule.next.time.to_rfc3339())),
                    ]),
                );
                let opts = DriveOptions { faster_first: false, replace_next_only: true };
                match self.scheduler.drive(&profile.community_id, opts).await {
                    Ok(()) => report.redrawn += 1,
                    Err(_) => report.failed += 1,
                }
            } else {
                let soul = self
                    .catalog
                    .resolve_or_default(&profile.schedule.next.soul.id, &profile.community_id);
                self.scheduler
                    .rearm(
                        &profile.community_id,
                        TimeAndSoul { time: profile.schedule.next.time, soul },
                    )
                    .await;
                report.resumed += 1;
            }
        }

        logging::info(
            Domain::Recovery,
            "reconciled",
            obj(&[
                ("resumed", v_int(report.resumed as i64)),
                ("redrawn", v_int(report.redrawn as i64)),
                ("failed", v_int(report.failed as i64)),
            ]),
        );
        report
    }
}

/// Non-paused communities whose next appearance is overdue beyond the grace
/// period. A healthy chain always keeps `next` in the future, so anything
/// returned here has silently stopped rescheduling.
pub fn find_stalled(
    profiles: &[CommunityProfile],
    now: DateTime<Utc>,
    grace: Duration,
) -> Vec<CommunityId> {
    profiles
        .iter()
        .filter(|p| !p.settings.paused && p.schedule.next.time + grace < now)
        .map(|p| p.community_id.clone())
        .collect()
}

//! Haunting scheduler.
//!
//! One armed timer per community: every (re)schedule cancels the existing
//! handle before arming the next one, under the community lock. When a timer
//! completes, the reveal is processed and the chain re-enters `drive` unless
//! the community is paused. All of this is wall-clock and process-local;
//! restarts are reconciled by `recover`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Utc};
use rand::Rng;
use tokio::time::sleep;

use crate::announce::Announcer;
use crate::cache::{GameCache, TimerHandle};
use crate::cycle::{apply_event, CycleEvent, CyclePhase};
use crate::locks::CommunityLocks;
use crate::logging::{self, obj, v_bool, v_str, Domain};
use crate::profile::{clamp_mean_delay, clamp_variation, Schedule, TimeAndSoul};
use crate::souls::SoulCatalog;
use crate::state::Config;
use crate::store::{ProfileStore, WriteTracker};

#[derive(Debug, Clone, Copy, Default)]
pub struct DriveOptions {
    /// Fixed short delay instead of the randomized one; bootstrap only.
    pub faster_first: bool,
    /// Overwrite `next` without rotating it into `past`.
    pub replace_next_only: bool,
}

/// Randomized offset from the mean, spread by the variation setting.
/// Never non-positive.
pub fn randomized_delay(rng: &mut impl Rng, mean_delay_mins: i64, variation: u32) -> Duration {
    let mean_secs = (clamp_mean_delay(mean_delay_mins) * 60) as f64;
    let spread = mean_secs * f64::from(clamp_variation(variation)) / 12.0;
    let drawn = rng.gen_range((mean_secs - spread)..(mean_secs + spread));
    Duration::milliseconds((drawn.max(1.0) * 1000.0) as i64)
}

struct Inner {
    cfg: Config,
    store: Arc<dyn ProfileStore>,
    cache: Arc<dyn GameCache>,
    catalog: Arc<SoulCatalog>,
    announcer: Arc<dyn Announcer>,
    locks: CommunityLocks,
    writes: Arc<WriteTracker>,
    phases: Mutex<HashMap<String, CyclePhase>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        store: Arc<dyn ProfileStore>,
        cache: Arc<dyn GameCache>,
        catalog: Arc<SoulCatalog>,
        announcer: Arc<dyn Announcer>,
        locks: CommunityLocks,
        writes: Arc<WriteTracker>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                store,
                cache,
                catalog,
                announcer,
                locks,
                writes,
                phases: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Decide the next appearance for a community and arm its timer.
    ///
    /// A missing profile or a store failure aborts this cycle only; the
    /// process keeps running and other communities are unaffected.
    pub async fn drive(&self, community_id: &str, opts: DriveOptions) -> Result<()> {
        let _guard = self.inner.locks.acquire(community_id).await;
        let profile = match self.inner.store.get(community_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                logging::warn(
                    Domain::Scheduler,
                    "profile_missing",
                    obj(&[("community", v_str(community_id))]),
                );
                return Ok(());
            }
            Err(err) => {
                logging::error(
                    Domain::Scheduler,
                    "profile_load_failed",
                    obj(&[
                        ("community", v_str(community_id)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                return Ok(());
            }
        };

        let delay = if opts.faster_first {
            Duration::seconds(self.inner.cfg.bootstrap_delay_secs)
        } else {
            randomized_delay(
                &mut rand::thread_rng(),
                profile.schedule.mean_delay_mins,
                profile.schedule.variation,
            )
        };
        let soul = self.inner.catalog.select_weighted(&mut rand::thread_rng(), community_id);
        let next = TimeAndSoul { time: Utc::now() + delay, soul };

        logging::info(
            Domain::Scheduler,
            "scheduled",
            obj(&[
                ("community", v_str(community_id)),
                ("at", v_str(&next.time.to_rfc3339())),
                ("soul", v_str(&next.soul.id.to_string())),
                ("faster_first", v_bool(opts.faster_first)),
            ]),
        );
        self.set_bounds(community_id, &profile.schedule, opts.faster_first);
        self.schedule_locked(community_id, next, opts.replace_next_only);
        Ok(())
    }

    /// Re-arm a persisted appearance as-is, without redrawing. Startup
    /// reconciliation uses this for schedules that are still in the future.
    pub async fn rearm(&self, community_id: &str, next: TimeAndSoul) {
        let _guard = self.inner.locks.acquire(community_id).await;
        self.schedule_locked(community_id, next, true);
    }

    /// Clear the paused flag and restart the chain with the bootstrap delay.
    pub async fn resume(&self, community_id: &str) -> Result<()> {
        self.inner.store.set_paused(community_id, false).await?;
        self.drive(community_id, DriveOptions { faster_first: true, replace_next_only: true })
            .await
    }

    pub fn phase(&self, community_id: &str) -> CyclePhase {
        let phases = self.inner.phases.lock().unwrap_or_else(|e| e.into_inner());
        phases.get(community_id).copied().unwrap_or(CyclePhase::Idle)
    }

    pub fn writes(&self) -> Arc<WriteTracker> {
        Arc::clone(&self.inner.writes)
    }

    /// Cancel-then-arm under the caller-held community lock. The cancel and
    /// the arm happen back to back, which is the whole single-flight story.
    fn schedule_locked(&self, community_id: &str, next: TimeAndSoul, replace_next_only: bool) {
        if let Some(old) = self.inner.cache.take_timer(community_id) {
            old.cancel();
        }
        self.transition(community_id, CycleEvent::Cancel);

        let store = Arc::clone(&self.inner.store);
        let id = community_id.to_string();
        let persisted = next.clone();
        self.inner.writes.enqueue(community_id, "schedule", async move {
            store.set_schedule(&id, &persisted, replace_next_only).await
        });

        let wait = (next.time - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
        let this = self.clone();
        let id = community_id.to_string();
        // Boxed: the fire path re-enters drive, which lands back here.
        let task: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            sleep(wait).await;
            this.fire(&id, next).await;
        });
        self.inner.cache.set_timer(community_id, TimerHandle::new(tokio::spawn(task)));
        self.transition(community_id, CycleEvent::Arm);
    }

    async fn fire(&self, community_id: &str, fired: TimeAndSoul) {
        {
            let _guard = self.inner.locks.acquire(community_id).await;
            // Our own handle; dropping it detaches without aborting this task.
            let _ = self.inner.cache.take_timer(community_id);
            self.transition(community_id, CycleEvent::Fire);
            self.inner.cache.clear_fetchers(community_id);
        }

        let profile = match self.inner.store.get(community_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                logging::warn(
                    Domain::Scheduler,
                    "fired_without_profile",
                    obj(&[("community", v_str(community_id))]),
                );
                self.transition(community_id, CycleEvent::Pause);
                return;
            }
            Err(err) => {
                // The chain for this community halts here; the liveness scan
                // is what surfaces it.
                logging::error(
                    Domain::Scheduler,
                    "fire_load_failed",
                    obj(&[
                        ("community", v_str(community_id)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                self.transition(community_id, CycleEvent::Pause);
                return;
            }
        };

        // A catalog soul created since scheduling beats the global default.
        let soul = if fired.soul.global {
            self.inner.catalog.select_weighted(&mut rand::thread_rng(), community_id)
        } else {
            fired.soul.clone()
        };

        logging::info(
            Domain::Scheduler,
            "haunting",
            obj(&[
                ("community", v_str(community_id)),
                ("soul", v_str(&soul.id.to_string())),
            ]),
        );

        let announcer = Arc::clone(&self.inner.announcer);
        let announced_id = community_id.to_string();
        let announced = soul.clone();
        tokio::spawn(async move {
            if let Err(err) = announcer.announce(&announced_id, &announced).await {
                logging::warn(
                    Domain::Announce,
                    "announce_failed",
                    obj(&[
                        ("community", v_str(&announced_id)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
            }
        });

        let store = Arc::clone(&self.inner.store);
        let counted = community_id.to_string();
        self.inner.writes.enqueue(community_id, "hauntings_count", async move {
            store.add_hauntings_count(&counted, 1).await
        });

        if profile.settings.paused {
            logging::info(
                Domain::Scheduler,
                "chain_paused",
                obj(&[("community", v_str(community_id))]),
            );
            self.transition(community_id, CycleEvent::Pause);
            return;
        }
        if let Err(err) = self.drive(community_id, DriveOptions::default()).await {
            logging::error(
                Domain::Scheduler,
                "rearm_failed",
                obj(&[
                    ("community", v_str(community_id)),
                    ("error", v_str(&err.to_string())),
                ]),
            );
        }
    }

    fn set_bounds(&self, community_id: &str, schedule: &Schedule, faster_first: bool) {
        let description = if faster_first {
            format!("about {} seconds from now", self.inner.cfg.bootstrap_delay_secs)
        } else {
            let mean = clamp_mean_delay(schedule.mean_delay_mins) as f64;
            let spread = mean * f64::from(clamp_variation(schedule.variation)) / 12.0;
            format!(
                "between {:.0} and {:.0} minutes after the last appearance",
                (mean - spread).max(0.0),
                mean + spread
            )
        };
        self.inner.cache.set_appearance_bounds(community_id, description);
    }

    fn transition(&self, community_id: &str, event: CycleEvent) {
        let mut phases = self.inner.phases.lock().unwrap_or_else(|e| e.into_inner());
        let current = phases.get(community_id).copied().unwrap_or(CyclePhase::Idle);
        match apply_event(current, event) {
            Ok(next) => {
                phases.insert(community_id.to_string(), next);
            }
            Err(err) => {
                logging::error(
                    Domain::Scheduler,
                    "phase_defect",
                    obj(&[
                        ("community", v_str(community_id)),
                        ("detail", v_str(&err.to_string())),
                    ]),
                );
                phases.insert(community_id.to_string(), event.target());
            }
        }
    }
}

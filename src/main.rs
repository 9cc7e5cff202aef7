use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tokio::time::sleep;

use hauntkeeper::announce::StderrAnnouncer;
use hauntkeeper::cache::InMemoryGameCache;
use hauntkeeper::locks::CommunityLocks;
use hauntkeeper::logging::{self, obj, v_int, v_str, Domain};
use hauntkeeper::recover::{find_stalled, RecoveryManager};
use hauntkeeper::scheduler::Scheduler;
use hauntkeeper::souls::SoulCatalog;
use hauntkeeper::state::Config;
use hauntkeeper::store::{ProfileStore, SqliteStore, WriteTracker};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    eprintln!("[hauntkeeper] starting with sqlite={} souls={}", cfg.sqlite_path, cfg.souls_dir);

    let store = Arc::new(SqliteStore::open(&cfg.sqlite_path)?);
    store.init()?;
    let profiles: Arc<dyn ProfileStore> = store.clone();
    let cache = Arc::new(InMemoryGameCache::new());
    let catalog = Arc::new(SoulCatalog::new(&cfg.souls_dir));
    let locks = CommunityLocks::new();
    let writes = Arc::new(WriteTracker::new());

    let scheduler = Scheduler::new(
        cfg.clone(),
        profiles.clone(),
        cache,
        catalog.clone(),
        Arc::new(StderrAnnouncer),
        locks,
        writes,
    );

    let recovery = RecoveryManager::new(profiles.clone(), scheduler.clone(), catalog);
    let report = recovery.reconcile_all().await;
    logging::info(
        Domain::System,
        "startup_complete",
        obj(&[
            ("resumed", v_int(report.resumed as i64)),
            ("redrawn", v_int(report.redrawn as i64)),
            ("failed", v_int(report.failed as i64)),
        ]),
    );

    // A halted chain keeps a stale `next` behind the clock; nothing inside
    // the chain can notice that, so patrol for it here.
    let grace = Duration::seconds(cfg.liveness_grace_secs);
    loop {
        sleep(std::time::Duration::from_secs(cfg.liveness_check_secs)).await;
        match profiles.stream_all().await {
            Ok(records) => {
                let readable: Vec<_> = records.into_iter().filter_map(Result::ok).collect();
                for community_id in find_stalled(&readable, Utc::now(), grace) {
                    logging::warn(
                        Domain::System,
                        "community_stalled",
                        obj(&[("community", v_str(&community_id))]),
                    );
                }
            }
            Err(err) => {
                logging::error(
                    Domain::System,
                    "liveness_scan_failed",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
            }
        }
    }
}

//! Durable profile storage.
//!
//! `ProfileStore`/`MemberStore` are the seams the game core talks through;
//! the SQLite implementation below is the production backing. Every setter
//! and increment is a single statement, individually atomic but not
//! cross-field transactional.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Notify;

use crate::logging::{self, obj, v_str, Domain};
use crate::profile::{
    clamp_mean_delay, clamp_variation, CommunityProfile, MemberProfile, Schedule, Settings, Stats,
    TimeAndSoul,
};
use crate::souls::Soul;

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, community_id: &str) -> Result<Option<CommunityProfile>>;
    async fn create(
        &self,
        community_id: &str,
        condemned_member_id: &str,
        schedule: Schedule,
    ) -> Result<CommunityProfile>;
    /// Every record independently fallible: one broken row never hides the
    /// rest. Restart the scan by calling again.
    async fn stream_all(&self) -> Result<Vec<Result<CommunityProfile>>>;
    /// Rotates `past <- next` unless `replace_next_only`.
    async fn set_schedule(
        &self,
        community_id: &str,
        next: &TimeAndSoul,
        replace_next_only: bool,
    ) -> Result<()>;
    async fn set_paused(&self, community_id: &str, paused: bool) -> Result<()>;
    async fn set_mean_delay(&self, community_id: &str, mins: i64) -> Result<()>;
    async fn set_variation(&self, community_id: &str, variation: u32) -> Result<()>;
    async fn set_condemned_member(&self, community_id: &str, member_id: &str) -> Result<()>;
    async fn set_last_condemned_member(&self, community_id: &str, member_id: &str) -> Result<()>;
    async fn add_hauntings_count(&self, community_id: &str, n: i64) -> Result<()>;
    async fn add_lifetime_souls_caught(&self, community_id: &str, n: i64) -> Result<()>;
    async fn add_souls_created_count(&self, community_id: &str, n: i64) -> Result<()>;
}

#[async_trait]
pub trait MemberStore: Send + Sync {
    /// Members come into existence lazily on first reference.
    async fn get_or_create(&self, community_id: &str, member_id: &str) -> Result<MemberProfile>;
    async fn add_souls(&self, community_id: &str, member_id: &str, delta: i64) -> Result<()>;
    async fn add_souls_caught(&self, community_id: &str, member_id: &str, n: i64) -> Result<()>;
    async fn add_career_souls_caught(&self, community_id: &str, member_id: &str, n: i64)
        -> Result<()>;
    async fn add_fetch_count(&self, community_id: &str, member_id: &str, n: i64) -> Result<()>;
    async fn add_condemned_count(&self, community_id: &str, member_id: &str, n: i64) -> Result<()>;
    async fn add_lifetime_xp(&self, community_id: &str, member_id: &str, xp: i64) -> Result<()>;
    async fn add_was_fooled_count(&self, community_id: &str, member_id: &str, n: i64) -> Result<()>;
    async fn add_fooled_another_count(
        &self,
        community_id: &str,
        member_id: &str,
        n: i64,
    ) -> Result<()>;
    async fn set_allow_lure(&self, community_id: &str, member_id: &str, allow: bool) -> Result<()>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self { conn: Mutex::new(Connection::open(path)?) })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Mutex::new(Connection::open_in_memory()?) })
    }

    pub fn init(&self) -> Result<()> {
        self.conn()?.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS community_profiles (
                community_id TEXT PRIMARY KEY,
                condemned_member_id TEXT NOT NULL,
                paused INTEGER NOT NULL DEFAULT 0,
                condemned_role_id TEXT,
                permission_role_id TEXT,
                next_time TEXT NOT NULL,
                next_soul TEXT NOT NULL,
                past_time TEXT,
                past_soul TEXT,
                mean_delay_mins INTEGER NOT NULL,
                variation INTEGER NOT NULL,
                lifetime_souls_caught INTEGER NOT NULL DEFAULT 0,
                hauntings_count INTEGER NOT NULL DEFAULT 0,
                souls_created_count INTEGER NOT NULL DEFAULT 0,
                last_condemned_member_id TEXT
            );
            CREATE TABLE IF NOT EXISTS member_profiles (
                community_id TEXT NOT NULL,
                member_id TEXT NOT NULL,
                souls INTEGER NOT NULL DEFAULT 0,
                souls_caught INTEGER NOT NULL DEFAULT 0,
                career_souls_caught INTEGER NOT NULL DEFAULT 0,
                fetch_count INTEGER NOT NULL DEFAULT 0,
                condemned_count INTEGER NOT NULL DEFAULT 0,
                lifetime_xp INTEGER NOT NULL DEFAULT 0,
                was_fooled_count INTEGER NOT NULL DEFAULT 0,
                fooled_another_count INTEGER NOT NULL DEFAULT 0,
                allow_lure INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (community_id, member_id)
            );
            COMMIT;",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store mutex poisoned"))
    }

    #[cfg(test)]
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }
}

const COMMUNITY_COLUMNS: &str = "community_id, condemned_member_id, paused, condemned_role_id, \
    permission_role_id, next_time, next_soul, past_time, past_soul, mean_delay_mins, variation, \
    lifetime_souls_caught, hauntings_count, souls_created_count, last_condemned_member_id";

struct RawCommunity {
    community_id: String,
    condemned_member_id: String,
    paused: bool,
    condemned_role_id: Option<String>,
    permission_role_id: Option<String>,
    next_time: String,
    next_soul: String,
    past_time: Option<String>,
    past_soul: Option<String>,
    mean_delay_mins: i64,
    variation: u32,
    lifetime_souls_caught: i64,
    hauntings_count: i64,
    souls_created_count: i64,
    last_condemned_member_id: Option<String>,
}

fn read_community_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCommunity> {
    Ok(RawCommunity {
        community_id: row.get(0)?,
        condemned_member_id: row.get(1)?,
        paused: row.get(2)?,
        condemned_role_id: row.get(3)?,
        permission_role_id: row.get(4)?,
        next_time: row.get(5)?,
        next_soul: row.get(6)?,
        past_time: row.get(7)?,
        past_soul: row.get(8)?,
        mean_delay_mins: row.get(9)?,
        variation: row.get(10)?,
        lifetime_souls_caught: row.get(11)?,
        hauntings_count: row.get(12)?,
        souls_created_count: row.get(13)?,
        last_condemned_member_id: row.get(14)?,
    })
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

fn parse_community(raw: RawCommunity) -> Result<CommunityProfile> {
    let next = TimeAndSoul {
        time: parse_time(&raw.next_time)?,
        soul: serde_json::from_str::<Soul>(&raw.next_soul).context("bad next soul")?,
    };
    let past = match (raw.past_time, raw.past_soul) {
        (Some(time), Some(soul)) => Some(TimeAndSoul {
            time: parse_time(&time)?,
            soul: serde_json::from_str::<Soul>(&soul).context("bad past soul")?,
        }),
        _ => None,
    };
    Ok(CommunityProfile {
        community_id: raw.community_id,
        condemned_member_id: raw.condemned_member_id,
        settings: Settings {
            paused: raw.paused,
            condemned_role_id: raw.condemned_role_id,
            permission_role_id: raw.permission_role_id,
        },
        schedule: Schedule {
            next,
            past,
            mean_delay_mins: raw.mean_delay_mins,
            variation: raw.variation,
        },
        stats: Stats {
            lifetime_souls_caught: raw.lifetime_souls_caught,
            hauntings_count: raw.hauntings_count,
            souls_created_count: raw.souls_created_count,
            last_condemned_member_id: raw.last_condemned_member_id,
        },
    })
}

fn read_member_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemberProfile> {
    Ok(MemberProfile {
        community_id: row.get(0)?,
        member_id: row.get(1)?,
        souls: row.get(2)?,
        souls_caught: row.get(3)?,
        career_souls_caught: row.get(4)?,
        fetch_count: row.get(5)?,
        condemned_count: row.get(6)?,
        lifetime_xp: row.get(7)?,
        was_fooled_count: row.get(8)?,
        fooled_another_count: row.get(9)?,
        allow_lure: row.get(10)?,
    })
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn get(&self, community_id: &str) -> Result<Option<CommunityProfile>> {
        let raw = {
            let conn = self.conn()?;
            conn.query_row(
                &format!("SELECT {COMMUNITY_COLUMNS} FROM community_profiles WHERE community_id = ?1"),
                params![community_id],
                read_community_row,
            )
            .optional()?
        };
        raw.map(parse_community).transpose()
    }

    async fn create(
        &self,
        community_id: &str,
        condemned_member_id: &str,
        schedule: Schedule,
    ) -> Result<CommunityProfile> {
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO community_profiles
                    (community_id, condemned_member_id, next_time, next_soul, past_time, past_soul,
                     mean_delay_mins, variation)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    community_id,
                    condemned_member_id,
                    schedule.next.time.to_rfc3339(),
                    serde_json::to_string(&schedule.next.soul)?,
                    schedule.past.as_ref().map(|p| p.time.to_rfc3339()),
                    schedule
                        .past
                        .as_ref()
                        .map(|p| serde_json::to_string(&p.soul))
                        .transpose()?,
                    clamp_mean_delay(schedule.mean_delay_mins),
                    clamp_variation(schedule.variation),
                ],
            )?;
        }
        // The condemned member must always resolve.
        self.get_or_create(community_id, condemned_member_id).await?;
        self.get(community_id)
            .await?
            .ok_or_else(|| anyhow!("created profile missing for {community_id}"))
    }

    async fn stream_all(&self) -> Result<Vec<Result<CommunityProfile>>> {
        let conn = self.conn()?;
        let mut stmt = stmt_all(&conn)?;
        let rows = stmt.query_map([], read_community_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(anyhow::Error::from).and_then(parse_community));
        }
        Ok(out)
    }

    async fn set_schedule(
        &self,
        community_id: &str,
        next: &TimeAndSoul,
        replace_next_only: bool,
    ) -> Result<()> {
        let conn = self.conn()?;
        let time = next.time.to_rfc3339();
        let soul = serde_json::to_string(&next.soul)?;
        if replace_next_only {
            conn.execute(
                "UPDATE community_profiles SET next_time = ?2, next_soul = ?3
                 WHERE community_id = ?1",
                params![community_id, time, soul],
            )?;
        } else {
            conn.execute(
                "UPDATE community_profiles
                 SET past_time = next_time, past_soul = next_soul, next_time = ?2, next_soul = ?3
                 WHERE community_id = ?1",
                params![community_id, time, soul],
            )?;
        }
        Ok(())
    }

    async fn set_paused(&self, community_id: &str, paused: bool) -> Result<()> {
        self.conn()?.execute(
            "UPDATE community_profiles SET paused = ?2 WHERE community_id = ?1",
            params![community_id, paused],
        )?;
        Ok(())
    }

    async fn set_mean_delay(&self, community_id: &str, mins: i64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE community_profiles SET mean_delay_mins = ?2 WHERE community_id = ?1",
            params![community_id, clamp_mean_delay(mins)],
        )?;
        Ok(())
    }

    async fn set_variation(&self, community_id: &str, variation: u32) -> Result<()> {
        self.conn()?.execute(
            "UPDATE community_profiles SET variation = ?2 WHERE community_id = ?1",
            params![community_id, clamp_variation(variation)],
        )?;
        Ok(())
    }

    async fn set_condemned_member(&self, community_id: &str, member_id: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE community_profiles SET condemned_member_id = ?2 WHERE community_id = ?1",
            params![community_id, member_id],
        )?;
        Ok(())
    }

    async fn set_last_condemned_member(&self, community_id: &str, member_id: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE community_profiles SET last_condemned_member_id = ?2 WHERE community_id = ?1",
            params![community_id, member_id],
        )?;
        Ok(())
    }

    async fn add_hauntings_count(&self, community_id: &str, n: i64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE community_profiles SET hauntings_count = hauntings_count + ?2
             WHERE community_id = ?1",
            params![community_id, n],
        )?;
        Ok(())
    }

    async fn add_lifetime_souls_caught(&self, community_id: &str, n: i64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE community_profiles SET lifetime_souls_caught = lifetime_souls_caught + ?2
             WHERE community_id = ?1",
            params![community_id, n],
        )?;
        Ok(())
    }

    async fn add_souls_created_count(&self, community_id: &str, n: i64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE community_profiles SET souls_created_count = souls_created_count + ?2
             WHERE community_id = ?1",
            params![community_id, n],
        )?;
        Ok(())
    }
}

fn stmt_all(conn: &Connection) -> rusqlite::Result<rusqlite::Statement<'_>> {
    conn.prepare(&format!("SELECT {COMMUNITY_COLUMNS} FROM community_profiles"))
}

const MEMBER_COLUMNS: &str = "community_id, member_id, souls, souls_caught, career_souls_caught, \
    fetch_count, condemned_count, lifetime_xp, was_fooled_count, fooled_another_count, allow_lure";

impl SqliteStore {
    fn bump_member(&self, column: &str, community_id: &str, member_id: &str, n: i64) -> Result<()> {
        self.conn()?.execute(
            &format!(
                "UPDATE member_profiles SET {column} = {column} + ?3
                 WHERE community_id = ?1 AND member_id = ?2"
            ),
            params![community_id, member_id, n],
        )?;
        Ok(())
    }
}

#[async_trait]
impl MemberStore for SqliteStore {
    async fn get_or_create(&self, community_id: &str, member_id: &str) -> Result<MemberProfile> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO member_profiles (community_id, member_id) VALUES (?1, ?2)",
            params![community_id, member_id],
        )?;
        Ok(conn.query_row(
            &format!(
                "SELECT {MEMBER_COLUMNS} FROM member_profiles
                 WHERE community_id = ?1 AND member_id = ?2"
            ),
            params![community_id, member_id],
            read_member_row,
        )?)
    }

    async fn add_souls(&self, community_id: &str, member_id: &str, delta: i64) -> Result<()> {
        self.bump_member("souls", community_id, member_id, delta)
    }

    async fn add_souls_caught(&self, community_id: &str, member_id: &str, n: i64) -> Result<()> {
        self.bump_member("souls_caught", community_id, member_id, n)
    }

    async fn add_career_souls_caught(
        &self,
        community_id: &str,
        member_id: &str,
        n: i64,
    ) -> Result<()> {
        self.bump_member("career_souls_caught", community_id, member_id, n)
    }

    async fn add_fetch_count(&self, community_id: &str, member_id: &str, n: i64) -> Result<()> {
        self.bump_member("fetch_count", community_id, member_id, n)
    }

    async fn add_condemned_count(&self, community_id: &str, member_id: &str, n: i64) -> Result<()> {
        self.bump_member("condemned_count", community_id, member_id, n)
    }

    async fn add_lifetime_xp(&self, community_id: &str, member_id: &str, xp: i64) -> Result<()> {
        self.bump_member("lifetime_xp", community_id, member_id, xp)
    }

    async fn add_was_fooled_count(&self, community_id: &str, member_id: &str, n: i64) -> Result<()> {
        self.bump_member("was_fooled_count", community_id, member_id, n)
    }

    async fn add_fooled_another_count(
        &self,
        community_id: &str,
        member_id: &str,
        n: i64,
    ) -> Result<()> {
        self.bump_member("fooled_another_count", community_id, member_id, n)
    }

    async fn set_allow_lure(&self, community_id: &str, member_id: &str, allow: bool) -> Result<()> {
        self.conn()?.execute(
            "UPDATE member_profiles SET allow_lure = ?3
             WHERE community_id = ?1 AND member_id = ?2",
            params![community_id, member_id, allow],
        )?;
        Ok(())
    }
}

type WriteFut = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct WriteJob {
    label: &'static str,
    fut: WriteFut,
}

struct WriteCounters {
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Background store writes, ordered per lane (one lane per community).
///
/// Scheduling-path persistence goes through here so timer arming never
/// blocks on the store; `settle` is the hook that confirms eventual
/// completion. Failures are logged, never propagated.
pub struct WriteTracker {
    lanes: Mutex<HashMap<String, UnboundedSender<WriteJob>>>,
    counters: Arc<WriteCounters>,
}

impl Default for WriteTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteTracker {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            counters: Arc::new(WriteCounters {
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Jobs on the same lane run in enqueue order; lanes run concurrently.
    pub fn enqueue(
        &self,
        lane: &str,
        label: &'static str,
        fut: impl Future<Output = Result<()>> + Send + 'static,
    ) {
        self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        let tx = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            lanes
                .entry(lane.to_string())
                .or_insert_with(|| spawn_lane(Arc::clone(&self.counters)))
                .clone()
        };
        if tx.send(WriteJob { label, fut: Box::pin(fut) }).is_err() {
            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
            logging::error(Domain::Store, "write_enqueue_failed", obj(&[("label", v_str(label))]));
        }
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Resolves once every enqueued write has completed.
    pub async fn settle(&self) {
        loop {
            let notified = self.counters.drained.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn spawn_lane(counters: Arc<WriteCounters>) -> UnboundedSender<WriteJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            if let Err(err) = job.fut.await {
                logging::error(
                    Domain::Store,
                    "write_failed",
                    obj(&[("label", v_str(job.label)), ("error", v_str(&err.to_string()))]),
                );
            }
            counters.in_flight.fetch_sub(1, Ordering::SeqCst);
            counters.drained.notify_waiters();
        }
    });
    tx
}

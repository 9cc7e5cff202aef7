//! Fetch adjudication.
//!
//! A fetch attempt walks a strict ordered rule set: fooled by a decoy
//! summon, window closed, already fetched, and finally a successful catch
//! with multiplicative bonuses. The whole read-check-write runs under the
//! community lock so two simultaneous attempts cannot both claim.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::cache::GameCache;
use crate::locks::CommunityLocks;
use crate::logging::{self, obj, v_int, v_str, Domain};
use crate::profile::{MemberId, TimeAndSoul};
use crate::souls::{soul_value, Soul};
use crate::state::Config;
use crate::store::{MemberStore, ProfileStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bonus {
    /// First successful fetch of the cycle.
    FirstFetch,
    /// Landed in the final two seconds of the claim window.
    BuzzerBeater,
    /// Drove the condemned member's balance from positive to zero or below.
    Defeat,
}

impl Bonus {
    pub fn factor(&self) -> i64 {
        match self {
            Bonus::FirstFetch => 2,
            Bonus::BuzzerBeater => 2,
            Bonus::Defeat => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Bonus::FirstFetch => "first_fetch",
            Bonus::BuzzerBeater => "buzzer_beater",
            Bonus::Defeat => "defeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// The condemned balance is at or below zero; the throne is up for grabs.
    Dethronable { condemned_member_id: MemberId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaughtDetails {
    pub soul: Soul,
    pub value: i64,
    pub bonuses: Vec<Bonus>,
    pub xp: i64,
    /// Caller's lifetime XP before this catch, for level-up rendering.
    pub prior_xp: i64,
    pub notices: Vec<Notice>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fooled { condemned_member_id: MemberId, was_fooled_count: i64 },
    NoHaunt { last_haunt: Option<TimeAndSoul> },
    AlreadyFetched { last_haunt: TimeAndSoul },
    Caught(CaughtDetails),
    CommunityNotSetUp,
}

/// Bonuses for a successful fetch, each independently decided.
/// `condemned_souls` is the balance read before any mutation, which is what
/// keeps the defeat bonus from re-triggering once the balance is gone.
pub fn applicable_bonuses(
    elapsed: Duration,
    window: Duration,
    first_fetcher: bool,
    condemned_souls: i64,
    value: i64,
) -> Vec<Bonus> {
    let mut bonuses = Vec::new();
    if first_fetcher {
        bonuses.push(Bonus::FirstFetch);
    }
    if elapsed > window - Duration::seconds(2) && elapsed <= window {
        bonuses.push(Bonus::BuzzerBeater);
    }
    if condemned_souls > 0 && condemned_souls - value <= 0 {
        bonuses.push(Bonus::Defeat);
    }
    bonuses
}

pub fn xp_for(value: i64, bonuses: &[Bonus]) -> i64 {
    bonuses.iter().fold(value, |acc, bonus| acc * bonus.factor())
}

pub struct ClaimResolver {
    cfg: Config,
    store: Arc<dyn ProfileStore>,
    members: Arc<dyn MemberStore>,
    cache: Arc<dyn GameCache>,
    locks: CommunityLocks,
}

impl ClaimResolver {
    pub fn new(
        cfg: Config,
        store: Arc<dyn ProfileStore>,
        members: Arc<dyn MemberStore>,
        cache: Arc<dyn GameCache>,
        locks: CommunityLocks,
    ) -> Self {
        Self { cfg, store, members, cache, locks }
    }

    pub async fn resolve(
        &self,
        community_id: &str,
        member_id: &str,
        now: DateTime<Utc>,
    ) -> Result<FetchOutcome> {
        let _guard = self.locks.acquire(community_id).await;

        let Some(profile) = self.store.get(community_id).await? else {
            return Ok(FetchOutcome::CommunityNotSetUp);
        };
        let caller = self.members.get_or_create(community_id, member_id).await?;
        let window = Duration::seconds(self.cfg.claim_window_secs);

        // 1. A recent decoy summon means this reveal was a fool's errand.
        if let Some(summoned) = self.cache.last_summon_time(community_id) {
            if now - summoned < window {
                self.members.get_or_create(community_id, &profile.condemned_member_id).await?;
                self.members.add_was_fooled_count(community_id, member_id, 1).await?;
                self.members
                    .add_fooled_another_count(community_id, &profile.condemned_member_id, 1)
                    .await?;
                logging::info(
                    Domain::Claim,
                    "fooled",
                    obj(&[
                        ("community", v_str(community_id)),
                        ("member", v_str(member_id)),
                        ("condemned", v_str(&profile.condemned_member_id)),
                    ]),
                );
                return Ok(FetchOutcome::Fooled {
                    condemned_member_id: profile.condemned_member_id,
                    was_fooled_count: caller.was_fooled_count + 1,
                });
            }
        }

        // 2. The window never opened or has already closed. The absolute
        // distance guards against a transiently future `past` during setup.
        let Some(past) = profile.schedule.past.clone() else {
            return Ok(FetchOutcome::NoHaunt { last_haunt: None });
        };
        let elapsed = now - past.time;
        if elapsed > window || -elapsed > window {
            return Ok(FetchOutcome::NoHaunt { last_haunt: Some(past) });
        }

        // 3. One catch per member per cycle.
        let fetched = self.cache.fetchers(community_id);
        if fetched.iter().any(|m| m == member_id) {
            return Ok(FetchOutcome::AlreadyFetched { last_haunt: past });
        }

        // 4. Caught. Bonuses read the condemned balance before any mutation.
        let condemned =
            self.members.get_or_create(community_id, &profile.condemned_member_id).await?;
        let value = soul_value(&past.soul);
        let bonuses = applicable_bonuses(elapsed, window, fetched.is_empty(), condemned.souls, value);
        let xp = xp_for(value, &bonuses);

        self.cache.add_fetcher(community_id, member_id);
        self.members.add_souls(community_id, member_id, value).await?;
        self.members.add_souls_caught(community_id, member_id, value).await?;
        self.members.add_career_souls_caught(community_id, member_id, value).await?;
        self.members.add_lifetime_xp(community_id, member_id, xp).await?;
        self.members.add_fetch_count(community_id, member_id, 1).await?;
        self.members.add_souls(community_id, &profile.condemned_member_id, -value).await?;
        self.members
            .add_souls_caught(community_id, &profile.condemned_member_id, value)
            .await?;
        self.store.add_lifetime_souls_caught(community_id, value).await?;

        let mut notices = Vec::new();
        if condemned.souls - value <= 0 {
            notices.push(Notice::Dethronable {
                condemned_member_id: profile.condemned_member_id.clone(),
            });
        }

        logging::info(
            Domain::Claim,
            "caught",
            obj(&[
                ("community", v_str(community_id)),
                ("member", v_str(member_id)),
                ("soul", v_str(&past.soul.id.to_string())),
                ("value", v_int(value)),
                ("xp", v_int(xp)),
            ]),
        );
        Ok(FetchOutcome::Caught(CaughtDetails {
            soul: past.soul,
            value,
            bonuses,
            xp,
            prior_xp: caller.lifetime_xp,
            notices,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryGameCache;
    use crate::profile::Schedule;
    use crate::souls::{Soul, SoulId};
    use crate::store::SqliteStore;

    fn soul(id: &str, rarity: u32) -> Soul {
        Soul {
            id: SoulId::Catalog(id.to_string()),
            name: id.to_string(),
            author: "vlad".to_string(),
            rarity,
            emoji: "\u{1F480}".to_string(),
            audio_cue: id.to_string(),
            global: false,
        }
    }

    struct Fixture {
        resolver: ClaimResolver,
        store: Arc<SqliteStore>,
        cache: Arc<InMemoryGameCache>,
        reveal: DateTime<Utc>,
    }

    /// Community "c1" with condemned "vlad" and a reveal (rarity 2) that
    /// just happened. `past_soul_rarity` of 0 means no past appearance.
    async fn fixture(past_soul_rarity: u32) -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.init().unwrap();
        let reveal = Utc::now();
        let past = if past_soul_rarity > 0 {
            Some(TimeAndSoul { time: reveal, soul: soul("husk", past_soul_rarity) })
        } else {
            None
        };
        let schedule = Schedule {
            next: TimeAndSoul { time: reveal + Duration::minutes(30), soul: soul("next", 3) },
            past,
            mean_delay_mins: 30,
            variation: 4,
        };
        store.create("c1", "vlad", schedule).await.unwrap();
        let cache = Arc::new(InMemoryGameCache::new());
        let resolver = ClaimResolver::new(
            Config::default(),
            store.clone(),
            store.clone(),
            cache.clone(),
            CommunityLocks::new(),
        );
        Fixture { resolver, store, cache, reveal }
    }

    #[test]
    fn bonus_boundaries() {
        let window = Duration::seconds(15);
        // Buzzer-beater opens strictly after window-2 and closes at window.
        let at = |ms: i64| applicable_bonuses(Duration::milliseconds(ms), window, false, 0, 2);
        assert!(at(13_000).is_empty());
        assert_eq!(at(13_001), vec![Bonus::BuzzerBeater]);
        assert_eq!(at(15_000), vec![Bonus::BuzzerBeater]);
        assert!(at(15_001).is_empty());

        // Defeat needs a strictly positive balance driven to zero or below.
        let defeat = |souls: i64| {
            applicable_bonuses(Duration::seconds(1), window, false, souls, 2)
                .contains(&Bonus::Defeat)
        };
        assert!(!defeat(3));
        assert!(defeat(2));
        assert!(defeat(1));
        assert!(!defeat(0));
        assert!(!defeat(-4));
    }

    #[test]
    fn xp_multiplies_through() {
        assert_eq!(xp_for(2, &[]), 2);
        assert_eq!(xp_for(2, &[Bonus::FirstFetch]), 4);
        assert_eq!(xp_for(2, &[Bonus::FirstFetch, Bonus::BuzzerBeater]), 8);
        assert_eq!(xp_for(2, &[Bonus::FirstFetch, Bonus::BuzzerBeater, Bonus::Defeat]), 32);
    }

    #[tokio::test]
    async fn window_scenario() {
        let f = fixture(2).await;

        let first = f.resolver.resolve("c1", "alice", f.reveal + Duration::seconds(10)).await.unwrap();
        match first {
            FetchOutcome::Caught(details) => {
                assert_eq!(details.value, 2);
                assert_eq!(details.bonuses, vec![Bonus::FirstFetch]);
                assert_eq!(details.xp, 4);
                assert_eq!(details.prior_xp, 0);
                assert!(details.notices.is_empty());
            }
            other => panic!("expected catch, got {other:?}"),
        }

        let again = f.resolver.resolve("c1", "alice", f.reveal + Duration::seconds(14)).await.unwrap();
        assert!(matches!(again, FetchOutcome::AlreadyFetched { .. }));

        let late = f.resolver.resolve("c1", "bob", f.reveal + Duration::seconds(20)).await.unwrap();
        assert!(matches!(late, FetchOutcome::NoHaunt { last_haunt: Some(_) }));

        let alice = f.store.get_or_create("c1", "alice").await.unwrap();
        assert_eq!(alice.souls, 2);
        assert_eq!(alice.souls_caught, 2);
        assert_eq!(alice.career_souls_caught, 2);
        assert_eq!(alice.lifetime_xp, 4);
        assert_eq!(alice.fetch_count, 1);
        let vlad = f.store.get_or_create("c1", "vlad").await.unwrap();
        assert_eq!(vlad.souls, -2);
        assert_eq!(vlad.souls_caught, 2);
        let community = f.store.get("c1").await.unwrap().unwrap();
        assert_eq!(community.stats.lifetime_souls_caught, 2);
    }

    #[tokio::test]
    async fn buzzer_beater_applies_only_inside_final_two_seconds() {
        let f = fixture(2).await;
        let exact = f.resolver.resolve("c1", "alice", f.reveal + Duration::seconds(13)).await.unwrap();
        match exact {
            FetchOutcome::Caught(details) => assert_eq!(details.bonuses, vec![Bonus::FirstFetch]),
            other => panic!("expected catch, got {other:?}"),
        }

        let f = fixture(2).await;
        let inside =
            f.resolver.resolve("c1", "alice", f.reveal + Duration::milliseconds(13_500)).await.unwrap();
        match inside {
            FetchOutcome::Caught(details) => {
                assert_eq!(details.bonuses, vec![Bonus::FirstFetch, Bonus::BuzzerBeater]);
                assert_eq!(details.xp, 8);
            }
            other => panic!("expected catch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn defeat_applies_once_and_never_retriggers() {
        let f = fixture(2).await;
        f.store.add_souls("c1", "vlad", 2).await.unwrap();

        let first = f.resolver.resolve("c1", "alice", f.reveal + Duration::seconds(1)).await.unwrap();
        match first {
            FetchOutcome::Caught(details) => {
                assert_eq!(details.bonuses, vec![Bonus::FirstFetch, Bonus::Defeat]);
                assert_eq!(details.xp, 16);
                assert_eq!(
                    details.notices,
                    vec![Notice::Dethronable { condemned_member_id: "vlad".to_string() }]
                );
            }
            other => panic!("expected catch, got {other:?}"),
        }
        assert_eq!(f.store.get_or_create("c1", "vlad").await.unwrap().souls, 0);

        // Balance already at zero: no defeat for the second fetcher.
        let second = f.resolver.resolve("c1", "bob", f.reveal + Duration::seconds(2)).await.unwrap();
        match second {
            FetchOutcome::Caught(details) => {
                assert!(details.bonuses.is_empty());
                assert_eq!(details.xp, 2);
                assert_eq!(
                    details.notices,
                    vec![Notice::Dethronable { condemned_member_id: "vlad".to_string() }]
                );
            }
            other => panic!("expected catch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn decoy_summon_fools_the_caller() {
        let f = fixture(2).await;
        let now = f.reveal + Duration::seconds(1);
        f.cache.set_last_summon_time("c1", now - Duration::seconds(5));

        let outcome = f.resolver.resolve("c1", "alice", now).await.unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Fooled {
                condemned_member_id: "vlad".to_string(),
                was_fooled_count: 1
            }
        );
        let alice = f.store.get_or_create("c1", "alice").await.unwrap();
        assert_eq!(alice.was_fooled_count, 1);
        assert_eq!(alice.souls, 0);
        let vlad = f.store.get_or_create("c1", "vlad").await.unwrap();
        assert_eq!(vlad.fooled_another_count, 1);
    }

    #[tokio::test]
    async fn no_haunt_when_none_recorded() {
        let f = fixture(0).await;
        let outcome = f.resolver.resolve("c1", "alice", f.reveal).await.unwrap();
        assert_eq!(outcome, FetchOutcome::NoHaunt { last_haunt: None });
    }

    #[tokio::test]
    async fn unknown_community_is_a_typed_outcome() {
        let f = fixture(2).await;
        let outcome = f.resolver.resolve("ghost-town", "alice", f.reveal).await.unwrap();
        assert_eq!(outcome, FetchOutcome::CommunityNotSetUp);
    }

    #[tokio::test]
    async fn simultaneous_fetches_cannot_both_claim() {
        let f = fixture(2).await;
        let resolver = Arc::new(f.resolver);
        let now = f.reveal + Duration::seconds(5);

        let a = {
            let r = Arc::clone(&resolver);
            tokio::spawn(async move { r.resolve("c1", "alice", now).await.unwrap() })
        };
        let b = {
            let r = Arc::clone(&resolver);
            tokio::spawn(async move { r.resolve("c1", "alice", now).await.unwrap() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let caught = [&a, &b].iter().filter(|o| matches!(o, FetchOutcome::Caught(_))).count();
        let repeats =
            [&a, &b].iter().filter(|o| matches!(o, FetchOutcome::AlreadyFetched { .. })).count();
        assert_eq!(caught, 1);
        assert_eq!(repeats, 1);

        let alice = f.store.get_or_create("c1", "alice").await.unwrap();
        assert_eq!(alice.souls, 2, "exactly one claim may land");
    }
}

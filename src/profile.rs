//! Durable per-community and per-member records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::souls::Soul;

pub type CommunityId = String;
pub type MemberId = String;

/// A scheduled or historical appearance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeAndSoul {
    pub time: DateTime<Utc>,
    pub soul: Soul,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub next: TimeAndSoul,
    pub past: Option<TimeAndSoul>,
    /// Mean minutes between hauntings. Administrative paths validate the
    /// range; the store clamps to >= 2 as a last line.
    pub mean_delay_mins: i64,
    /// Spread factor 1-10; higher means wider jitter around the mean.
    pub variation: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub paused: bool,
    pub condemned_role_id: Option<String>,
    pub permission_role_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self { paused: false, condemned_role_id: None, permission_role_id: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub lifetime_souls_caught: i64,
    pub hauntings_count: i64,
    pub souls_created_count: i64,
    pub last_condemned_member_id: Option<MemberId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommunityProfile {
    pub community_id: CommunityId,
    /// Holder of the claimable balance. Always resolvable to a member
    /// profile via get-or-create.
    pub condemned_member_id: MemberId,
    pub settings: Settings,
    pub schedule: Schedule,
    pub stats: Stats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberProfile {
    pub community_id: CommunityId,
    pub member_id: MemberId,
    /// Current balance; goes negative when the condemned keeps losing.
    pub souls: i64,
    pub souls_caught: i64,
    pub career_souls_caught: i64,
    pub fetch_count: i64,
    pub condemned_count: i64,
    pub lifetime_xp: i64,
    pub was_fooled_count: i64,
    pub fooled_another_count: i64,
    pub allow_lure: bool,
}

pub fn clamp_mean_delay(mins: i64) -> i64 {
    mins.max(2)
}

pub fn clamp_variation(variation: u32) -> u32 {
    variation.clamp(1, 10)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::souls::{default_soul, SoulId};

    #[test]
    fn clamps() {
        assert_eq!(clamp_mean_delay(0), 2);
        assert_eq!(clamp_mean_delay(45), 45);
        assert_eq!(clamp_variation(0), 1);
        assert_eq!(clamp_variation(11), 10);
        assert_eq!(clamp_variation(7), 7);
    }

    #[test]
    fn schedule_roundtrips_through_json() {
        let schedule = Schedule {
            next: TimeAndSoul { time: Utc::now(), soul: default_soul() },
            past: None,
            mean_delay_mins: 30,
            variation: 4,
        };
        let json = serde_json::to_string(&schedule).unwrap();
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mean_delay_mins, 30);
        assert_eq!(back.next.soul.id, SoulId::Default);
    }
}

//! Reveal announcements.
//!
//! The platform side (voice playback, embeds) lives outside this crate;
//! the scheduler only needs a best-effort sink. Failures are logged by the
//! caller and never reach scheduling control flow.

use anyhow::Result;
use async_trait::async_trait;

use crate::logging::{self, obj, v_bool, v_int, v_str, Domain};
use crate::souls::Soul;

#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, community_id: &str, soul: &Soul) -> Result<()>;
}

/// Logs the reveal; stands in wherever no platform connection exists.
pub struct StderrAnnouncer;

#[async_trait]
impl Announcer for StderrAnnouncer {
    async fn announce(&self, community_id: &str, soul: &Soul) -> Result<()> {
        logging::info(
            Domain::Announce,
            "reveal",
            obj(&[
                ("community", v_str(community_id)),
                ("soul", v_str(&soul.id.to_string())),
                ("name", v_str(&soul.name)),
                ("rarity", v_int(i64::from(soul.rarity))),
                ("global", v_bool(soul.global)),
            ]),
        );
        Ok(())
    }
}

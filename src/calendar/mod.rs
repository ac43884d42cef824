use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use log::info;
use poise::serenity_prelude::GuildId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use uuid::Uuid;

use crate::bot::Bot;

pub mod calendar;
pub mod lock;
pub mod manager;
pub mod scheduler;
pub mod store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// How often a repeating event comes back once it ends.
pub enum Repeat {
    Daily,
    Weekly,
    Monthly,
}

impl Repeat {
    /// Short form used in commands ("d", "w", "m").
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "d" | "daily" => Some(Self::Daily),
            "w" | "weekly" => Some(Self::Weekly),
            "m" | "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A requested change to an event's repeat mode. `Off` clears it, which is
/// distinct from not mentioning repeat at all in an update.
pub enum RepeatPatch {
    Off,
    Every(Repeat),
}

#[derive(Debug, Default, Clone, PartialEq)]
/// Partially specified event, as produced by the argument parser. Absent
/// fields keep their previous value when applied to an existing event.
pub struct EventDraft {
    pub name: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub repeat: Option<RepeatPatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A single calendar entry. The id is assigned at creation and never
/// changes, even when a repeating event advances to its next occurrence.
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Start of the event.
    pub start: DateTime<Utc>,
    /// End of the event. Always at or after `start`.
    pub end: DateTime<Utc>,
    pub repeat: Option<Repeat>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalendarError {
    #[error("event not found")]
    NotFound,
    #[error("unrecognized timezone: {0}")]
    InvalidZone(String),
    #[error("an event needs at least a name and a start")]
    IncompleteDraft,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out waiting for the calendar lock of guild {0}")]
    Timeout(GuildId),
}

/// Periodically rebuilds the scheduler state from the store. Timers only
/// live in this process, so this pass is the sole recovery path after a
/// restart; it also arms events that drifted into the look-ahead window
/// since the previous pass.
pub async fn reconciler_task(bot: Arc<Bot>) -> Result<(), anyhow::Error> {
    let mut shutdown = bot.shutdown.resubscribe();

    let schedule = saffron::Cron::new(
        bot.data
            .config
            .scheduler
            .reconcile
            .parse()
            .map_err(|e| anyhow::anyhow!("failed to parse the reconcile cron expression: {}", e))?,
    );

    // run a pass at the start to re-arm timers lost with the previous
    // process.
    bot.data.manager.reconcile().await;

    loop {
        // calculate the next cron execution and wait
        let current_time = Utc::now();

        // this souldn't fail.
        // if it does, we should terminate
        let next = schedule
            .next_after(current_time)
            .context("failed to get next date")?;

        let sleep_time = next - current_time;
        info!(
            "next reconciliation in {}s, trigger at {}",
            sleep_time.num_seconds(),
            next
        );

        let wait = sleep(
            sleep_time
                .to_std()
                .context("failed to convert a chrono duration to a std duration")?,
        );

        tokio::select! {
            _ = wait => {
                bot.data.manager.reconcile().await;
            },
            _ = shutdown.recv() => {
                return Ok(());
            }
        }
    }
}

use std::{collections::HashMap, fs, io, sync::Arc};

use anyhow::{bail, Context};
use log::debug;
use poise::serenity_prelude::GuildId;

use crate::cfg::Config;

use super::calendar::Calendar;

pub type Data = HashMap<GuildId, Calendar>;

/// Durable side of the system: one calendar per guild, the whole map
/// persisted as a single postcard file on every mutation. Reads hand out
/// cloned snapshots; mutation flows re-save the snapshot they changed
/// while holding the guild's lease.
#[derive(Debug)]
pub struct Store {
    data: Data,
    save_path: String,
}

impl Store {
    pub fn new(config: Arc<Config>) -> Result<Self, anyhow::Error> {
        let path = shellexpand::full_with_context_no_errors(
            &config.storage.path,
            || dirs::home_dir().and_then(|p| p.to_str().map(|s| s.to_string())),
            |f| std::env::var(f).ok(),
        )
        .to_string();

        match fs::read(&path) {
            Ok(r) => Ok(Self {
                data: postcard::from_bytes(&r)?,
                save_path: path,
            }),
            Err(err) => match err.kind() {
                // The only case where we can accept an error is when the db does not exists
                io::ErrorKind::NotFound => Ok(Self {
                    data: Data::default(),
                    save_path: path,
                }),
                _ => bail!(err),
            },
        }
    }

    fn persist(&self) -> Result<(), anyhow::Error> {
        let data = postcard::to_allocvec(&self.data)?;
        fs::write(&self.save_path, data).context("failed to write the database file")?;
        Ok(())
    }

    /// Snapshot of a guild's calendar, if it has one.
    pub fn find(&self, guild_id: GuildId) -> Option<Calendar> {
        self.data.get(&guild_id).cloned()
    }

    pub fn contains(&self, guild_id: GuildId) -> bool {
        self.data.contains_key(&guild_id)
    }

    /// Upserts a calendar and persists the map.
    pub fn save(&mut self, calendar: Calendar) -> Result<(), anyhow::Error> {
        self.data.insert(calendar.guild_id, calendar);
        self.persist()
    }

    /// Drops a guild's calendar and persists the map. Returns the removed
    /// calendar so the caller can unschedule its events.
    pub fn delete(&mut self, guild_id: GuildId) -> Result<Option<Calendar>, anyhow::Error> {
        let removed = self.data.remove(&guild_id);
        if removed.is_some() {
            debug!("removed calendar of guild {}", guild_id);
            self.persist()?;
        }
        Ok(removed)
    }

    /// Every guild this process stores a calendar for; the working set of
    /// the reconciliation pass.
    pub fn guild_ids(&self) -> Vec<GuildId> {
        self.data.keys().copied().collect()
    }
}

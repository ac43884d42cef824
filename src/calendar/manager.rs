use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use log::info;
use poise::serenity_prelude::{ChannelId, GuildId, RoleId, UserId};
use tokio::sync::RwLock;

use crate::cfg::Config;

use super::{
    calendar::Calendar,
    lock::GuildLocks,
    scheduler::{EventScheduler, Notifier},
    store::Store,
    CalendarError, Event, EventDraft,
};

#[derive(Debug, PartialEq, Eq)]
pub enum InitOutcome {
    Initialized,
    AlreadyInitialized,
    UnknownZone,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TimezoneOutcome {
    Updated,
    /// The shift would relocate the earliest event into the past; nothing
    /// was changed.
    RejectedPast,
    UnknownZone,
    NotInitialized,
}

#[derive(Debug, Clone, Copy)]
pub enum PermTarget {
    Role(RoleId),
    User(UserId),
}

/// Ties the store, the guild leases and the scheduler together and
/// exposes the mutation flows commands and platform events go through.
/// Every flow here follows the same discipline: acquire the guild lease,
/// re-read the calendar, mutate, persist, update the timers, release.
pub struct Manager {
    config: Arc<Config>,
    store: Arc<RwLock<Store>>,
    locks: GuildLocks,
    pub scheduler: EventScheduler,
}

impl Manager {
    pub fn new(config: Arc<Config>, notifier: Arc<dyn Notifier>) -> Result<Self, anyhow::Error> {
        let store = Arc::new(RwLock::new(Store::new(config.clone())?));
        let locks = GuildLocks::new(&config.lock)?;
        let scheduler = EventScheduler::new(&config, store.clone(), locks.clone(), notifier)?;

        Ok(Self {
            config,
            store,
            locks,
            scheduler,
        })
    }

    /// Lock-free read of a guild's calendar.
    pub async fn snapshot(&self, guild_id: GuildId) -> Option<Calendar> {
        self.store.read().await.find(guild_id)
    }

    /// Registers a calendar for a newly joined guild. Does nothing when
    /// one already exists.
    pub async fn ensure_calendar(&self, guild_id: GuildId) -> Result<(), anyhow::Error> {
        let lease = self.locks.acquire(guild_id).await?;
        let mut store = self.store.write().await;
        if !store.contains(guild_id) {
            store.save(Calendar::new(
                guild_id,
                self.config.bot.default_prefix.clone(),
            ))?;
            info!("registered calendar for guild {}", guild_id);
        }
        drop(store);
        lease.release();
        Ok(())
    }

    /// First-time setup: assigns the timezone and the default channel.
    /// Refuses to re-assign a timezone that is already set.
    pub async fn init_calendar(
        &self,
        guild_id: GuildId,
        channel: ChannelId,
        zone: &str,
    ) -> Result<InitOutcome, anyhow::Error> {
        let lease = self.locks.acquire(guild_id).await?;
        let mut store = self.store.write().await;
        let mut calendar = store.find(guild_id).unwrap_or_else(|| {
            Calendar::new(guild_id, self.config.bot.default_prefix.clone())
        });

        if calendar.timezone.is_some() {
            return Ok(InitOutcome::AlreadyInitialized);
        }

        match calendar.update_timezone(zone, Utc::now()) {
            Err(CalendarError::InvalidZone(_)) => Ok(InitOutcome::UnknownZone),
            Err(err) => Err(err.into()),
            Ok(_) => {
                calendar.update_default_channel(channel);
                store.save(calendar)?;
                drop(store);
                lease.release();
                info!("initialized calendar for guild {} in {}", guild_id, zone);
                Ok(InitOutcome::Initialized)
            }
        }
    }

    pub async fn add_event(
        &self,
        guild_id: GuildId,
        draft: EventDraft,
    ) -> Result<Event, anyhow::Error> {
        let lease = self.locks.acquire(guild_id).await?;
        let mut store = self.store.write().await;
        let mut calendar = store
            .find(guild_id)
            .context("calendar is not initialized")?;

        let event = calendar.add_event(draft)?;
        store.save(calendar.clone())?;
        drop(store);

        self.scheduler.schedule_event(&calendar, &event);
        lease.release();
        Ok(event)
    }

    pub async fn delete_event(
        &self,
        guild_id: GuildId,
        index: usize,
    ) -> Result<Event, anyhow::Error> {
        let lease = self.locks.acquire(guild_id).await?;
        let mut store = self.store.write().await;
        let mut calendar = store
            .find(guild_id)
            .context("calendar is not initialized")?;

        let event = calendar.delete_event(index)?;
        store.save(calendar)?;
        drop(store);

        self.scheduler.unschedule_event(event.id);
        lease.release();
        Ok(event)
    }

    pub async fn update_event(
        &self,
        guild_id: GuildId,
        index: usize,
        draft: &EventDraft,
    ) -> Result<Event, anyhow::Error> {
        let lease = self.locks.acquire(guild_id).await?;
        let mut store = self.store.write().await;
        let mut calendar = store
            .find(guild_id)
            .context("calendar is not initialized")?;

        let event = calendar.update_event(index, draft)?;
        store.save(calendar.clone())?;
        drop(store);

        self.scheduler.reschedule_event(&calendar, &event);
        lease.release();
        Ok(event)
    }

    pub async fn update_timezone(
        &self,
        guild_id: GuildId,
        zone: &str,
    ) -> Result<TimezoneOutcome, anyhow::Error> {
        let lease = self.locks.acquire(guild_id).await?;
        let mut store = self.store.write().await;
        let Some(mut calendar) = store.find(guild_id) else {
            return Ok(TimezoneOutcome::NotInitialized);
        };

        match calendar.update_timezone(zone, Utc::now()) {
            Err(CalendarError::InvalidZone(_)) => Ok(TimezoneOutcome::UnknownZone),
            Err(err) => Err(err.into()),
            Ok(None) => Ok(TimezoneOutcome::RejectedPast),
            Ok(Some(events)) => {
                store.save(calendar.clone())?;
                drop(store);

                // every instant moved: every timer is re-armed
                for event in &events {
                    self.scheduler.reschedule_event(&calendar, event);
                }
                lease.release();
                Ok(TimezoneOutcome::Updated)
            }
        }
    }

    /// Changes where announcements go. Pending notify jobs captured the
    /// old channel, so everything is re-armed.
    pub async fn update_default_channel(
        &self,
        guild_id: GuildId,
        channel: ChannelId,
    ) -> Result<(), anyhow::Error> {
        let lease = self.locks.acquire(guild_id).await?;
        let mut store = self.store.write().await;
        let mut calendar = store
            .find(guild_id)
            .context("calendar is not initialized")?;

        calendar.update_default_channel(channel);
        store.save(calendar.clone())?;
        drop(store);

        for event in &calendar.events {
            self.scheduler.reschedule_event(&calendar, event);
        }
        lease.release();
        Ok(())
    }

    pub async fn update_prefix(
        &self,
        guild_id: GuildId,
        prefix: String,
    ) -> Result<(), anyhow::Error> {
        let lease = self.locks.acquire(guild_id).await?;
        let mut store = self.store.write().await;
        let mut calendar = store
            .find(guild_id)
            .context("calendar is not initialized")?;

        calendar.update_prefix(prefix);
        store.save(calendar)?;
        drop(store);
        lease.release();
        Ok(())
    }

    pub async fn set_perm(
        &self,
        guild_id: GuildId,
        node: &str,
        target: PermTarget,
        deny: bool,
    ) -> Result<(), anyhow::Error> {
        let lease = self.locks.acquire(guild_id).await?;
        let mut store = self.store.write().await;
        let mut calendar = store
            .find(guild_id)
            .context("calendar is not initialized")?;

        match (target, deny) {
            (PermTarget::Role(role), true) => calendar.deny_role_perm(role, node),
            (PermTarget::Role(role), false) => calendar.allow_role_perm(role, node),
            (PermTarget::User(user), true) => calendar.deny_user_perm(user, node),
            (PermTarget::User(user), false) => calendar.allow_user_perm(user, node),
        }
        store.save(calendar)?;
        drop(store);
        lease.release();
        Ok(())
    }

    /// Platform told us a member left: their id means nothing anymore.
    pub async fn forget_user(&self, guild_id: GuildId, user: UserId) -> Result<(), anyhow::Error> {
        let lease = self.locks.acquire(guild_id).await?;
        let mut store = self.store.write().await;
        if let Some(mut calendar) = store.find(guild_id) {
            calendar.forget_user(user);
            store.save(calendar)?;
        }
        drop(store);
        lease.release();
        Ok(())
    }

    pub async fn forget_role(&self, guild_id: GuildId, role: RoleId) -> Result<(), anyhow::Error> {
        let lease = self.locks.acquire(guild_id).await?;
        let mut store = self.store.write().await;
        if let Some(mut calendar) = store.find(guild_id) {
            calendar.forget_role(role);
            store.save(calendar)?;
        }
        drop(store);
        lease.release();
        Ok(())
    }

    /// Drops a guild we no longer serve, timers included.
    pub async fn remove_guild(&self, guild_id: GuildId) -> Result<(), anyhow::Error> {
        let lease = self.locks.acquire(guild_id).await?;
        let mut store = self.store.write().await;
        let removed = store.delete(guild_id)?;
        drop(store);

        if let Some(calendar) = removed {
            for event in &calendar.events {
                self.scheduler.unschedule_event(event.id);
            }
        }
        lease.release();
        Ok(())
    }

    /// Full idempotent re-scan: every stored guild gets a scheduling
    /// pass. This recovers the timers a previous process took down with
    /// it and arms events that entered the look-ahead window since the
    /// last pass.
    pub async fn reconcile(&self) {
        let guild_ids = self.store.read().await.guild_ids();
        info!("reconciliation pass over {} guilds", guild_ids.len());

        for guild_id in guild_ids {
            let calendar = self.store.read().await.find(guild_id);
            if let Some(calendar) = calendar {
                self.scheduler.schedule_upcoming_events(&calendar);
            }
        }
    }
}

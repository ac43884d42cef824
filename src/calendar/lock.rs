use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use anyhow::Context;
use log::warn;
use poise::serenity_prelude::GuildId;
use tokio::time::{sleep, Instant};

use crate::cfg::LockConfig;

use super::LockError;

#[derive(Debug)]
struct LeaseEntry {
    token: u64,
    expires_at: Instant,
}

#[derive(Debug)]
struct Inner {
    entries: Mutex<HashMap<GuildId, LeaseEntry>>,
    next_token: AtomicU64,
    delay: Duration,
    timeout: Duration,
    expiry: Duration,
}

/// Per-guild mutation leases. Every read-modify-write of a guild's
/// calendar claims the guild's entry first; claiming polls with a fixed
/// delay until a wall-clock budget runs out. A lease expires on its own
/// after `expiry`, so a holder that never releases cannot block a guild
/// forever.
#[derive(Debug, Clone)]
pub struct GuildLocks {
    inner: Arc<Inner>,
}

/// Exclusive claim on one guild's calendar. Released explicitly or when
/// dropped, so an early return in the middle of a mutation flow cannot
/// leave the guild locked.
#[must_use]
#[derive(Debug)]
pub struct Lease {
    inner: Arc<Inner>,
    guild_id: GuildId,
    token: u64,
}

fn entries_of(inner: &Inner) -> MutexGuard<'_, HashMap<GuildId, LeaseEntry>> {
    inner.entries.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GuildLocks {
    pub fn new(config: &LockConfig) -> Result<Self, anyhow::Error> {
        Ok(Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                delay: humantime::parse_duration(&config.delay)
                    .context("invalid format in the lock delay duration")?,
                timeout: humantime::parse_duration(&config.timeout)
                    .context("invalid format in the lock timeout duration")?,
                expiry: humantime::parse_duration(&config.expiry)
                    .context("invalid format in the lock expiry duration")?,
            }),
        })
    }

    /// Claims the guild's entry, retrying every `delay` until `timeout`
    /// wall-clock time has passed.
    pub async fn acquire(&self, guild_id: GuildId) -> Result<Lease, LockError> {
        let deadline = Instant::now() + self.inner.timeout;

        loop {
            if let Some(lease) = self.try_claim(guild_id) {
                return Ok(lease);
            }
            if Instant::now() + self.inner.delay >= deadline {
                warn!("lock acquisition for guild {} ran out of budget", guild_id);
                return Err(LockError::Timeout(guild_id));
            }
            sleep(self.inner.delay).await;
        }
    }

    /// Single atomic attempt: succeeds when the entry is absent or its
    /// lease has expired.
    fn try_claim(&self, guild_id: GuildId) -> Option<Lease> {
        let now = Instant::now();
        let mut entries = entries_of(&self.inner);

        match entries.get(&guild_id) {
            Some(entry) if entry.expires_at > now => None,
            stale => {
                if stale.is_some() {
                    warn!("claiming an expired lease for guild {}", guild_id);
                }
                let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
                entries.insert(
                    guild_id,
                    LeaseEntry {
                        token,
                        expires_at: now + self.inner.expiry,
                    },
                );
                Some(Lease {
                    inner: Arc::clone(&self.inner),
                    guild_id,
                    token,
                })
            }
        }
    }
}

impl Lease {
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn release(self) {
        // Drop removes the entry
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut entries = entries_of(&self.inner);
        // an expired lease may have been claimed by someone else in the
        // meantime; only remove what is still ours
        if entries
            .get(&self.guild_id)
            .is_some_and(|entry| entry.token == self.token)
        {
            entries.remove(&self.guild_id);
        }
    }
}

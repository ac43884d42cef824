use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration as StdDuration,
};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info};
use poise::serenity_prelude::{ChannelId, GuildId};
use tokio::{
    sync::RwLock,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use uuid::Uuid;

use crate::cfg::Config;

use super::{calendar::Calendar, lock::GuildLocks, store::Store, CalendarError, Event};

/// Outbound message capability. The production implementation talks to
/// discord; tests record what would have been sent.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, channel: ChannelId, content: String) -> Result<(), anyhow::Error>;
}

/// Active timer tasks keyed by event id. `install` is claim-by-id: a
/// second install for the same event is a no-op, which is what keeps
/// repeated scheduling passes from arming duplicate timers. Fired one-shot
/// jobs keep their entry until the event is unscheduled for the same
/// reason.
#[derive(Debug, Default)]
struct JobMap {
    jobs: HashMap<Uuid, JoinHandle<()>>,
}

impl JobMap {
    fn install(&mut self, id: Uuid, spawn: impl FnOnce() -> JoinHandle<()>) -> bool {
        if self.jobs.contains_key(&id) {
            return false;
        }
        self.jobs.insert(id, spawn());
        true
    }

    fn cancel(&mut self, id: Uuid) {
        if let Some(handle) = self.jobs.remove(&id) {
            handle.abort();
        }
    }

    /// Removes the entry without aborting the task. Used by a job that is
    /// retiring its own handle.
    fn forget(&mut self, id: Uuid) {
        self.jobs.remove(&id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.jobs.len()
    }
}

fn guard(map: &Mutex<JobMap>) -> MutexGuard<'_, JobMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    lookahead: Duration,
    store: Arc<RwLock<Store>>,
    locks: GuildLocks,
    notifier: Arc<dyn Notifier>,
    notify_jobs: Mutex<JobMap>,
    finalize_jobs: Mutex<JobMap>,
}

/// Arms and fires the per-event timers. Two per event at most: a notify
/// timer at the start instant and a finalize timer at the end instant.
/// Only events within the look-ahead window get resident timers; the
/// reconciliation pass sweeps the rest in as they come close.
#[derive(Clone)]
pub struct EventScheduler {
    inner: Arc<Inner>,
}

impl EventScheduler {
    pub fn new(
        config: &Config,
        store: Arc<RwLock<Store>>,
        locks: GuildLocks,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, anyhow::Error> {
        let lookahead = Duration::from_std(
            humantime::parse_duration(&config.scheduler.lookahead)
                .context("invalid format in the scheduler lookahead duration")?,
        )
        .context("failed to get a duration from standard")?;

        Ok(Self {
            inner: Arc::new(Inner {
                lookahead,
                store,
                locks,
                notifier,
                notify_jobs: Mutex::new(JobMap::default()),
                finalize_jobs: Mutex::new(JobMap::default()),
            }),
        })
    }

    /// Evaluates every event of a calendar against one `now` snapshot.
    /// Safe to re-run at any time: installs are claim-by-id.
    pub fn schedule_upcoming_events(&self, calendar: &Calendar) {
        let now = Utc::now();
        for event in &calendar.events {
            self.schedule_event_at(calendar, event, now);
        }
    }

    pub fn schedule_event(&self, calendar: &Calendar, event: &Event) {
        self.schedule_event_at(calendar, event, Utc::now());
    }

    pub fn schedule_event_at(&self, calendar: &Calendar, event: &Event, now: DateTime<Utc>) {
        if event.start - now < self.inner.lookahead {
            self.install_notify_job(calendar, event, now);
        }
        if event.end - now < self.inner.lookahead {
            self.install_finalize_job(calendar.guild_id, event, now);
        }
    }

    /// Cancels both timers of an event. No-op for ids that have none.
    pub fn unschedule_event(&self, event_id: Uuid) {
        guard(&self.inner.notify_jobs).cancel(event_id);
        guard(&self.inner.finalize_jobs).cancel(event_id);
    }

    /// Re-arms an event whose instants or destination channel changed.
    pub fn reschedule_event(&self, calendar: &Calendar, event: &Event) {
        self.unschedule_event(event.id);
        self.schedule_event(calendar, event);
    }

    fn install_notify_job(&self, calendar: &Calendar, event: &Event, now: DateTime<Utc>) {
        if event.start <= now {
            // an event that already started is never announced late
            debug!("event {} already started, not announcing", event.id);
            return;
        }
        let Some(channel) = calendar.default_channel else {
            debug!(
                "guild {} has no default channel, not announcing event {}",
                calendar.guild_id, event.id
            );
            return;
        };

        guard(&self.inner.notify_jobs).install(event.id, || {
            let notifier = Arc::clone(&self.inner.notifier);
            let content = announcement(event);
            let fire_at = fire_instant(event.start, now);
            let event_id = event.id;

            tokio::spawn(async move {
                sleep_until(fire_at).await;
                if let Err(err) = notifier.send_message(channel, content).await {
                    error!("failed to announce event {}: {:?}", event_id, err);
                }
            })
        });
    }

    fn install_finalize_job(&self, guild_id: GuildId, event: &Event, now: DateTime<Utc>) {
        guard(&self.inner.finalize_jobs).install(event.id, || {
            let scheduler = self.clone();
            let event_id = event.id;
            // an end that already passed (e.g. while the process was down)
            // fires right away so the pass that installed us cleans it up
            let fire_at = fire_instant(event.end.max(now), now);

            tokio::spawn(async move {
                sleep_until(fire_at).await;
                // a failed finalization must never take the scheduler
                // down; the event stays as stored until the next
                // reconciliation pass retries it
                if let Err(err) = scheduler.finalize(guild_id, event_id).await {
                    error!("failed to finalize event {}: {:?}", event_id, err);
                }
            })
        });
    }

    /// End-of-event transition, running inside the timer task: under the
    /// guild lease, re-fetch the calendar (the event we captured at
    /// install time may be long stale), delete or advance the event, and
    /// re-arm it if it advanced.
    async fn finalize(&self, guild_id: GuildId, event_id: Uuid) -> Result<(), anyhow::Error> {
        let lease = self.inner.locks.acquire(guild_id).await?;

        let mut store = self.inner.store.write().await;
        let Some(mut calendar) = store.find(guild_id) else {
            debug!("guild {} vanished before finalizing {}", guild_id, event_id);
            self.retire(event_id);
            return Ok(());
        };

        let advanced = match calendar.advance_or_delete(event_id) {
            Ok(advanced) => advanced,
            Err(CalendarError::NotFound) => {
                // deleted while this timer was in flight
                debug!("event {} vanished before finalizing", event_id);
                self.retire(event_id);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        store.save(calendar.clone())?;
        drop(store);

        self.retire(event_id);
        if let Some(event) = advanced {
            info!(
                "event {} of guild {} advanced to {}",
                event.name, guild_id, event.start
            );
            self.schedule_event(&calendar, &event);
        } else {
            info!(
                "event {} of guild {} ended and was removed",
                event_id, guild_id
            );
        }

        lease.release();
        Ok(())
    }

    /// Drops both handles of an event from within its own finalize task.
    /// The notify job is aborted (the event is gone, announcing it would
    /// be wrong); the finalize handle is the running task itself and is
    /// only forgotten, never aborted.
    fn retire(&self, event_id: Uuid) {
        guard(&self.inner.notify_jobs).cancel(event_id);
        guard(&self.inner.finalize_jobs).forget(event_id);
    }

    #[cfg(test)]
    pub fn job_counts(&self) -> (usize, usize) {
        (
            guard(&self.inner.notify_jobs).len(),
            guard(&self.inner.finalize_jobs).len(),
        )
    }
}

fn announcement(event: &Event) -> String {
    let mut content = format!(
        "**{}** is starting now! (<t:{}> to <t:{}>)",
        event.name,
        event.start.timestamp(),
        event.end.timestamp()
    );
    if let Some(description) = &event.description {
        content.push_str(&format!("\n`{}`", description));
    }
    content
}

fn fire_instant(at: DateTime<Utc>, now: DateTime<Utc>) -> Instant {
    let delta = (at - now).to_std().unwrap_or(StdDuration::ZERO);
    Instant::now() + delta
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use poise::serenity_prelude::{ChannelId, GuildId};
    use tokio::sync::RwLock;

    use crate::calendar::calendar::Calendar;
    use crate::calendar::lock::GuildLocks;
    use crate::calendar::store::Store;
    use crate::calendar::{EventDraft, Repeat, RepeatPatch};
    use crate::cfg::{Config, StorageConfig};

    use super::{EventScheduler, Notifier};

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(ChannelId, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_message(
            &self,
            channel: ChannelId,
            content: String,
        ) -> Result<(), anyhow::Error> {
            self.sent.lock().unwrap().push((channel, content));
            Ok(())
        }
    }

    struct Rig {
        scheduler: EventScheduler,
        store: Arc<RwLock<Store>>,
        notifier: Arc<RecordingNotifier>,
        db_path: std::path::PathBuf,
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.db_path);
        }
    }

    fn rig(name: &str) -> Rig {
        let mut db_path = std::env::temp_dir();
        db_path.push(format!("agenda-sched-{}-{}.db", name, std::process::id()));
        let _ = std::fs::remove_file(&db_path);

        let config = Arc::new(Config {
            storage: StorageConfig {
                path: db_path.to_str().unwrap().to_string(),
            },
            ..Config::default()
        });

        let store = Arc::new(RwLock::new(Store::new(config.clone()).unwrap()));
        let locks = GuildLocks::new(&config.lock).unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler =
            EventScheduler::new(&config, store.clone(), locks, notifier.clone()).unwrap();

        Rig {
            scheduler,
            store,
            notifier,
            db_path,
        }
    }

    fn calendar_with_event(draft: EventDraft) -> Calendar {
        let mut calendar = Calendar::new(GuildId::new(1), "+".to_string());
        calendar.update_timezone("UTC", Utc::now()).unwrap();
        calendar.update_default_channel(ChannelId::new(99));
        calendar.add_event(draft).unwrap();
        calendar
    }

    fn draft(name: &str, start_in: Duration, end_in: Duration) -> EventDraft {
        let now = Utc::now();
        EventDraft {
            name: Some(name.to_string()),
            start: Some(now + start_in),
            end: Some(now + end_in),
            ..EventDraft::default()
        }
    }

    #[tokio::test]
    async fn double_schedule_installs_one_timer_pair() {
        let rig = rig("idempotent");
        let calendar =
            calendar_with_event(draft("soon", Duration::minutes(30), Duration::minutes(90)));
        let event = calendar.events[0].clone();

        rig.scheduler.schedule_event(&calendar, &event);
        rig.scheduler.schedule_event(&calendar, &event);

        assert_eq!(rig.scheduler.job_counts(), (1, 1));
    }

    #[tokio::test]
    async fn far_events_get_no_timers() {
        let rig = rig("far");
        let calendar =
            calendar_with_event(draft("later", Duration::hours(5), Duration::hours(6)));
        let event = calendar.events[0].clone();

        rig.scheduler.schedule_event(&calendar, &event);

        assert_eq!(rig.scheduler.job_counts(), (0, 0));
    }

    #[tokio::test]
    async fn scheduling_pass_is_idempotent() {
        let rig = rig("reconcile");
        let calendar =
            calendar_with_event(draft("soon", Duration::minutes(30), Duration::minutes(90)));

        rig.scheduler.schedule_upcoming_events(&calendar);
        rig.scheduler.schedule_upcoming_events(&calendar);

        assert_eq!(rig.scheduler.job_counts(), (1, 1));
        assert!(rig.notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unschedule_cancels_both_timers() {
        let rig = rig("unschedule");
        let calendar =
            calendar_with_event(draft("soon", Duration::minutes(30), Duration::minutes(90)));
        let event = calendar.events[0].clone();

        rig.scheduler.schedule_event(&calendar, &event);
        rig.scheduler.unschedule_event(event.id);

        assert_eq!(rig.scheduler.job_counts(), (0, 0));
        // unknown ids are a no-op
        rig.scheduler.unschedule_event(uuid::Uuid::new_v4());
    }

    #[tokio::test]
    async fn notify_announces_once_in_the_default_channel() {
        let rig = rig("notify");
        let calendar = calendar_with_event(draft(
            "kickoff",
            Duration::milliseconds(200),
            Duration::minutes(30),
        ));
        let event = calendar.events[0].clone();

        rig.scheduler.schedule_event(&calendar, &event);
        tokio::time::sleep(StdDuration::from_millis(600)).await;

        // a later pass must not announce again: the fired handle stays
        rig.scheduler.schedule_event(&calendar, &event);
        tokio::time::sleep(StdDuration::from_millis(200)).await;

        let sent = rig.notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ChannelId::new(99));
        assert!(sent[0].1.contains("kickoff"));
    }

    #[tokio::test]
    async fn started_events_are_not_announced() {
        let rig = rig("started");
        let calendar =
            calendar_with_event(draft("running", -Duration::minutes(10), Duration::minutes(30)));
        let event = calendar.events[0].clone();

        rig.scheduler.schedule_event(&calendar, &event);
        assert_eq!(rig.scheduler.job_counts(), (0, 1));
    }

    async fn wait_for_event_count(rig: &Rig, guild: GuildId, expected: usize) {
        for _ in 0..150 {
            let store = rig.store.read().await;
            let count = store.find(guild).map(|c| c.events.len());
            drop(store);
            if count.unwrap_or(0) == expected {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        panic!("store never reached {} events", expected);
    }

    #[tokio::test]
    async fn finalize_removes_one_shot_events() {
        let rig = rig("finalize-delete");
        let calendar = calendar_with_event(draft(
            "fleeting",
            -Duration::minutes(10),
            Duration::milliseconds(50),
        ));
        let event = calendar.events[0].clone();
        rig.store.write().await.save(calendar.clone()).unwrap();

        rig.scheduler.schedule_event(&calendar, &event);
        wait_for_event_count(&rig, calendar.guild_id, 0).await;

        // handles are gone once the job retired itself
        for _ in 0..150 {
            if rig.scheduler.job_counts() == (0, 0) {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        assert_eq!(rig.scheduler.job_counts(), (0, 0));
    }

    #[tokio::test]
    async fn finalize_advances_repeating_events() {
        let rig = rig("finalize-advance");
        let mut seed = draft("standup", -Duration::minutes(10), Duration::milliseconds(50));
        seed.repeat = Some(RepeatPatch::Every(Repeat::Daily));
        let calendar = calendar_with_event(seed);
        let event = calendar.events[0].clone();
        rig.store.write().await.save(calendar.clone()).unwrap();

        rig.scheduler.schedule_event(&calendar, &event);

        for _ in 0..150 {
            let advanced = rig
                .store
                .read()
                .await
                .find(calendar.guild_id)
                .unwrap()
                .events[0]
                .start
                > event.start;
            if advanced {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }

        let stored = rig.store.read().await.find(calendar.guild_id).unwrap();
        assert_eq!(stored.events.len(), 1);
        assert_eq!(stored.events[0].id, event.id);
        assert_eq!(stored.events[0].start, event.start + Duration::days(1));
        assert_eq!(stored.events[0].end, event.end + Duration::days(1));
    }

    #[tokio::test]
    async fn missed_ends_are_finalized_immediately() {
        let rig = rig("missed-end");
        let calendar = calendar_with_event(draft(
            "while-down",
            -Duration::hours(3),
            -Duration::hours(1),
        ));
        rig.store.write().await.save(calendar.clone()).unwrap();

        rig.scheduler.schedule_upcoming_events(&calendar);
        wait_for_event_count(&rig, calendar.guild_id, 0).await;
    }
}

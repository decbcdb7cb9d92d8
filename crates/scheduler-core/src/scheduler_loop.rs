//! The scheduler's background timer tasks: lease management, the two
//! enqueue sweeps (daily summary, work sampling), the worker poll loop,
//! and retention cleanup.
//!
//! Each activity is one `tokio::time::interval` task. A tick that is
//! still running when the next one fires is skipped rather than
//! overlapped — `max_instances=1` from the concurrency model — enforced
//! with a `tokio::sync::Mutex<()>` per task that a tick `try_lock`s
//! instead of awaiting.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::collab::{ObservabilitySink, TimezoneResolver, UserSettingsStore};
use crate::config::SchedulerConfig;
use crate::dedup::DeduplicationIndex;
use crate::handler::Dispatcher;
use crate::job::{JobTable, ScheduledJob};
use crate::kv::KvStore;
use crate::lease::LeaderLease;
use crate::retry::RetryPolicy;
use crate::worker::{Worker, WorkerConfig};

/// One non-overlapping periodic activity.
struct Guarded {
    busy: Mutex<()>,
}

impl Guarded {
    fn new() -> Self {
        Self { busy: Mutex::new(()) }
    }

    /// Runs `body` unless the previous tick of this same activity is
    /// still in flight, in which case the tick is skipped.
    async fn tick<F, Fut>(&self, name: &'static str, body: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let Ok(_permit) = self.busy.try_lock() else {
            tracing::debug!(task = name, "skipping tick: previous run still in flight");
            return;
        };
        body().await;
    }
}

pub struct SchedulerLoopBuilder<S, U, T> {
    store: S,
    config: SchedulerConfig,
    process_id: String,
    dispatcher: Option<Dispatcher>,
    user_settings: Option<Arc<U>>,
    timezones: Option<Arc<T>>,
    sink: Option<Arc<dyn ObservabilitySink>>,
}

impl<S, U, T> SchedulerLoopBuilder<S, U, T>
where
    S: KvStore + Clone + 'static,
    U: UserSettingsStore + 'static,
    T: TimezoneResolver + 'static,
{
    pub fn new(store: S, config: SchedulerConfig, process_id: impl Into<String>) -> Self {
        Self {
            store,
            config,
            process_id: process_id.into(),
            dispatcher: None,
            user_settings: None,
            timezones: None,
            sink: None,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_user_settings(mut self, store: Arc<U>) -> Self {
        self.user_settings = Some(store);
        self
    }

    pub fn with_timezones(mut self, resolver: Arc<T>) -> Self {
        self.timezones = Some(resolver);
        self
    }

    pub fn with_observability(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> SchedulerLoop<S, U, T> {
        let dispatcher = self.dispatcher.unwrap_or_else(|| Dispatcher::new(Default::default()));
        let mut worker = Worker::new(
            self.store.clone(),
            dispatcher,
            RetryPolicy::new(self.config.base_delay_seconds, self.config.max_attempts),
            WorkerConfig {
                worker_id: Some(self.process_id.clone()),
                polling_limit: self.config.polling_limit,
                lock_timeout_minutes: self.config.lock_timeout_minutes,
            },
        );
        if let Some(sink) = &self.sink {
            worker = worker.with_observability(sink.clone());
        }

        SchedulerLoop {
            job_table: JobTable::new(self.store.clone()),
            dedup: DeduplicationIndex::new(self.store.clone()),
            lease: Arc::new(Mutex::new(
                LeaderLease::new(self.store, self.process_id, self.config.stale_lease_seconds)
                    .with_instance_info(format!("pid:{}", std::process::id())),
            )),
            worker: Arc::new(worker),
            config: self.config,
            user_settings: self.user_settings,
            timezones: self.timezones,
            sink: self.sink,
        }
    }
}

/// Assembled background tasks over one logical scheduler instance.
/// Cheaply clonable; every background task holds its own `Arc` handles.
pub struct SchedulerLoop<S, U, T> {
    job_table: JobTable<S>,
    dedup: DeduplicationIndex<S>,
    lease: Arc<Mutex<LeaderLease<S>>>,
    worker: Arc<Worker<S>>,
    config: SchedulerConfig,
    user_settings: Option<Arc<U>>,
    timezones: Option<Arc<T>>,
    sink: Option<Arc<dyn ObservabilitySink>>,
}

/// Handle returned by [`SchedulerLoop::run`]; drop or call
/// [`SchedulerHandle::shutdown`] to stop every task and release the
/// lease if held.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl<S, U, T> SchedulerLoop<S, U, T>
where
    S: KvStore + Clone + Send + Sync + 'static,
    U: UserSettingsStore + Send + Sync + 'static,
    T: TimezoneResolver + Send + Sync + 'static,
{
    /// Spawns every background task and returns a handle to stop them.
    pub fn run(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(spawn_interval(
            "lease",
            std::time::Duration::from_secs(self.config.lock_check_interval_seconds),
            shutdown_rx.clone(),
            {
                let lease = self.lease.clone();
                let guard = Arc::new(Guarded::new());
                move || {
                    let lease = lease.clone();
                    let guard = guard.clone();
                    async move {
                        guard
                            .tick("lease", || async move {
                                let now = Utc::now();
                                let mut held = lease.lock().await;
                                if held.is_acquired() {
                                    if let Err(err) = held.refresh(now).await {
                                        tracing::warn!(error = %err, "lease refresh failed");
                                    }
                                } else if let Err(err) = held.acquire(now).await {
                                    tracing::warn!(error = %err, "lease acquire attempt failed");
                                }
                            })
                            .await;
                    }
                }
            },
        ));

        tasks.push(spawn_interval(
            "worker-poll",
            std::time::Duration::from_secs(self.config.poll_interval_seconds),
            shutdown_rx.clone(),
            {
                let worker = self.worker.clone();
                let guard = Arc::new(Guarded::new());
                move || {
                    let worker = worker.clone();
                    let guard = guard.clone();
                    async move {
                        guard
                            .tick("worker-poll", || async move {
                                if let Err(err) = worker.poll_and_process_jobs(Utc::now()).await {
                                    tracing::warn!(error = %err, "worker poll failed");
                                }
                            })
                            .await;
                    }
                }
            },
        ));

        if let (Some(user_settings), Some(timezones)) = (self.user_settings.clone(), self.timezones.clone()) {
            tasks.push(spawn_interval(
                "daily-summary-enqueue",
                std::time::Duration::from_secs(3600),
                shutdown_rx.clone(),
                {
                    let lease = self.lease.clone();
                    let job_table = self.job_table.clone();
                    let dedup = self.dedup.clone();
                    let users = self.config.daily_summary_users.clone();
                    let guard = Arc::new(Guarded::new());
                    move || {
                        let lease = lease.clone();
                        let job_table = job_table.clone();
                        let dedup = dedup.clone();
                        let user_settings = user_settings.clone();
                        let timezones = timezones.clone();
                        let users = users.clone();
                        let guard = guard.clone();
                        async move {
                            guard
                                .tick("daily-summary-enqueue", || async move {
                                    if !lease.lock().await.is_acquired() {
                                        return;
                                    }
                                    enqueue_daily_summaries(
                                        &users,
                                        user_settings.as_ref(),
                                        timezones.as_ref(),
                                        &job_table,
                                        &dedup,
                                        Utc::now(),
                                    )
                                    .await;
                                })
                                .await;
                        }
                    }
                },
            ));

            if self.config.work_sampling_prompts_per_day > 0 {
                tasks.push(spawn_interval(
                    "work-sampling-enqueue",
                    std::time::Duration::from_secs(3600),
                    shutdown_rx.clone(),
                    {
                        let lease = self.lease.clone();
                        let job_table = self.job_table.clone();
                        let dedup = self.dedup.clone();
                        let users = self.config.daily_summary_users.clone();
                        let slots_per_day = self.config.work_sampling_prompts_per_day;
                        let guard = Arc::new(Guarded::new());
                        let user_settings = self.user_settings.clone();
                        let timezones = self.timezones.clone();
                        move || {
                            let lease = lease.clone();
                            let job_table = job_table.clone();
                            let dedup = dedup.clone();
                            let users = users.clone();
                            let guard = guard.clone();
                            let user_settings = user_settings.clone();
                            let timezones = timezones.clone();
                            async move {
                                guard
                                    .tick("work-sampling-enqueue", || async move {
                                        if !lease.lock().await.is_acquired() {
                                            return;
                                        }
                                        if let (Some(user_settings), Some(timezones)) = (user_settings, timezones) {
                                            enqueue_work_sampling(
                                                &users,
                                                user_settings.as_ref(),
                                                timezones.as_ref(),
                                                &job_table,
                                                &dedup,
                                                slots_per_day,
                                                Utc::now(),
                                            )
                                            .await;
                                        }
                                    })
                                    .await;
                            }
                        }
                    },
                ));
            }
        }

        tasks.push(spawn_interval(
            "cleanup",
            std::time::Duration::from_secs(3600),
            shutdown_rx,
            {
                let lease = self.lease.clone();
                let job_table = self.job_table.clone();
                let retention_days = self.config.retention_days;
                let guard = Arc::new(Guarded::new());
                let sink = self.sink.clone();
                move || {
                    let lease = lease.clone();
                    let job_table = job_table.clone();
                    let guard = guard.clone();
                    let sink = sink.clone();
                    async move {
                        guard
                            .tick("cleanup", || async move {
                                if !lease.lock().await.is_acquired() {
                                    return;
                                }
                                let now = Utc::now();
                                if now.hour() != 2 {
                                    return;
                                }
                                match job_table.cleanup_old_jobs(now, retention_days).await {
                                    Ok(count) => tracing::info!(count, "cleanup swept old terminal jobs"),
                                    Err(err) => {
                                        if let Some(sink) = &sink {
                                            sink.capture_exception(&err.to_string());
                                        }
                                        tracing::warn!(error = %err, "cleanup sweep failed");
                                    }
                                }
                            })
                            .await;
                    }
                }
            },
        ));

        SchedulerHandle { shutdown: shutdown_tx, tasks }
    }
}

fn spawn_interval<F, Fut>(
    name: &'static str,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
    mut make_tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    make_tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!(task = name, "stopping background task");
                        break;
                    }
                }
            }
        }
    })
}

async fn enqueue_daily_summaries<S: KvStore, U: UserSettingsStore, T: TimezoneResolver>(
    users: &[String],
    user_settings: &U,
    timezones: &T,
    job_table: &JobTable<S>,
    dedup: &DeduplicationIndex<S>,
    now_utc: DateTime<Utc>,
) {
    for user_id in users {
        let tz = match user_settings.get_user_settings(user_id).await {
            Ok(settings) => timezones.resolve(settings.timezone.as_deref()),
            Err(err) => {
                tracing::warn!(user_id, error = %err, "failed to look up user settings, defaulting to UTC");
                timezones.resolve(None)
            }
        };

        let (next_7am_utc, local_date) = next_7am_utc(tz, now_utc);
        let logical_id = format!("daily_summary#{user_id}#{local_date}");
        let bucket = local_date.to_string();

        let job = ScheduledJob::new(
            "daily_summary",
            serde_json::json!({ "user_id": user_id }),
            next_7am_utc,
            now_utc,
        );

        match dedup.schedule_if_needed(&job, job_table, &logical_id, &bucket).await {
            Ok(true) => tracing::debug!(user_id, %logical_id, "scheduled daily summary"),
            Ok(false) => {}
            Err(err) => tracing::warn!(user_id, error = %err, "failed to schedule daily summary"),
        }
    }
}

/// Next 7:00 AM in `tz` strictly after `now_utc`, and the local calendar
/// date it falls on.
fn next_7am_utc(tz: Tz, now_utc: DateTime<Utc>) -> (DateTime<Utc>, NaiveDate) {
    let now_local = now_utc.with_timezone(&tz);
    let mut local_date = now_local.date_naive();
    let mut candidate_naive = local_date.and_hms_opt(7, 0, 0).expect("valid time");

    if now_local.naive_local() >= candidate_naive {
        local_date += Duration::days(1);
        candidate_naive = local_date.and_hms_opt(7, 0, 0).expect("valid time");
    }

    let candidate = tz
        .from_local_datetime(&candidate_naive)
        .single()
        .unwrap_or_else(|| tz.from_utc_datetime(&candidate_naive));

    (candidate.with_timezone(&Utc), local_date)
}

async fn enqueue_work_sampling<S: KvStore, U: UserSettingsStore, T: TimezoneResolver>(
    users: &[String],
    user_settings: &U,
    timezones: &T,
    job_table: &JobTable<S>,
    dedup: &DeduplicationIndex<S>,
    slots_per_day: u32,
    now_utc: DateTime<Utc>,
) {
    for user_id in users {
        let tz = match user_settings.get_user_settings(user_id).await {
            Ok(settings) => timezones.resolve(settings.timezone.as_deref()),
            Err(err) => {
                tracing::warn!(user_id, error = %err, "failed to look up user settings, defaulting to UTC");
                timezones.resolve(None)
            }
        };

        let local_date = now_utc.with_timezone(&tz).date_naive();
        let workday_start = local_date.and_hms_opt(8, 0, 0).expect("valid time");
        let workday_end = local_date.and_hms_opt(17, 0, 0).expect("valid time");
        let slot_duration = (workday_end - workday_start) / slots_per_day as i32;

        for slot_index in 0..slots_per_day {
            let slot_start = workday_start + slot_duration * slot_index as i32;
            let offset = seeded_offset_within_slot(user_id, local_date, slot_index, slot_duration);
            let random_local = slot_start + offset;

            let random_utc = tz
                .from_local_datetime(&random_local)
                .single()
                .unwrap_or_else(|| tz.from_utc_datetime(&random_local))
                .with_timezone(&Utc);

            let logical_id = format!("work_sampling_prompt:{user_id}:{local_date}:{slot_index}");
            let bucket = local_date.to_string();

            let job = ScheduledJob::new(
                "work_sampling_prompt",
                serde_json::json!({ "user_id": user_id }),
                random_utc,
                now_utc,
            );

            match dedup.schedule_if_needed(&job, job_table, &logical_id, &bucket).await {
                Ok(true) => tracing::debug!(user_id, %logical_id, "scheduled work sampling prompt"),
                Ok(false) => {}
                Err(err) => tracing::warn!(user_id, error = %err, "failed to schedule work sampling prompt"),
            }
        }
    }
}

/// Deterministic offset within a slot, seeded by the first 4 bytes
/// (big-endian) of `SHA-256(user_id-local_date-slot_index)`. Any
/// reimplementation using the same hash and byte order converges on the
/// same seed integer, though the mapping from seed to offset here is a
/// uniform scaling rather than a bit-exact port of a specific PRNG.
fn seeded_offset_within_slot(
    user_id: &str,
    local_date: NaiveDate,
    slot_index: u32,
    slot_duration: Duration,
) -> Duration {
    let seed_string = format!("{user_id}-{local_date}-{slot_index}");
    let mut hasher = Sha256::new();
    hasher.update(seed_string.as_bytes());
    let digest = hasher.finalize();
    let seed = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);

    let fraction = seed as f64 / u32::MAX as f64;
    let offset_millis = (slot_duration.num_milliseconds() as f64 * fraction) as i64;
    Duration::milliseconds(offset_millis)
}

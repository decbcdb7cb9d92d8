//! `daily_summary`: the leader-produced trigger that kicks off one
//! user's daily summary chain by enqueueing `generate_summary`.
//!
//! Mirrors the original's `daily_summary_scheduler.py` -> `summary_jobs.py`
//! handoff, collapsed into a single handler rather than two modules.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::collab::{TimezoneResolver, UserSettingsStore};
use crate::handler::JobHandler;
use crate::job::{JobTable, ScheduledJob};
use crate::kv::KvStore;

#[derive(Debug, Deserialize)]
pub struct DailySummaryPayload {
    pub user_id: String,
}

pub struct DailySummaryHandler<U, T, S> {
    user_settings: U,
    timezones: T,
    job_table: JobTable<S>,
}

impl<U: UserSettingsStore, T: TimezoneResolver, S: KvStore> DailySummaryHandler<U, T, S> {
    pub fn new(user_settings: U, timezones: T, job_table: JobTable<S>) -> Self {
        Self { user_settings, timezones, job_table }
    }
}

#[async_trait]
impl<U: UserSettingsStore, T: TimezoneResolver, S: KvStore + Send + Sync> JobHandler
    for DailySummaryHandler<U, T, S>
{
    type Payload = DailySummaryPayload;

    async fn handle(&self, payload: DailySummaryPayload) -> Result<(), String> {
        let settings = self
            .user_settings
            .get_user_settings(&payload.user_id)
            .await
            .map_err(|e| e.to_string())?;
        let tz = self.timezones.resolve(settings.timezone.as_deref());

        let now = Utc::now();
        let local_date = now.with_timezone(&tz).date_naive();
        let prompt = format!("Summarize {}'s activity for {local_date}.", payload.user_id);

        let follow_up = ScheduledJob::new(
            "generate_summary",
            serde_json::json!({ "user_id": payload.user_id, "prompt": prompt }),
            now,
            now,
        );
        self.job_table.put_job(&follow_up).await.map_err(|e| e.to_string())
    }
}

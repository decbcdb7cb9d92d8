//! `heartbeat_event`: a diagnostic job that reschedules itself forever.
//!
//! There is no separate cron entry for this one — the first row is
//! enqueued once at startup and every successful run enqueues the next.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::handler::JobHandler;
use crate::job::{JobTable, ScheduledJob};
use crate::kv::KvStore;

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    pub correlation_id: Uuid,
}

pub struct HeartbeatHandler<S> {
    job_table: JobTable<S>,
    interval: Duration,
}

impl<S: KvStore> HeartbeatHandler<S> {
    pub fn new(job_table: JobTable<S>, interval: Duration) -> Self {
        Self { job_table, interval }
    }
}

#[async_trait]
impl<S: KvStore + Send + Sync> JobHandler for HeartbeatHandler<S> {
    type Payload = HeartbeatPayload;

    async fn handle(&self, payload: HeartbeatPayload) -> Result<(), String> {
        tracing::info!(correlation_id = %payload.correlation_id, "heartbeat tick");

        let now = Utc::now();
        let follow_up = ScheduledJob::new(
            "heartbeat_event",
            serde_json::json!({ "correlation_id": Uuid::new_v4() }),
            now + self.interval,
            now,
        );
        self.job_table.put_job(&follow_up).await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_kv::MemoryKv;

    #[tokio::test]
    async fn handling_one_heartbeat_enqueues_exactly_one_follow_up() {
        let store = MemoryKv::new();
        let table = JobTable::new(store.clone());
        let handler = HeartbeatHandler::new(JobTable::new(store.clone()), Duration::seconds(60));

        handler
            .handle(HeartbeatPayload { correlation_id: Uuid::new_v4() })
            .await
            .unwrap();

        let now = Utc::now() + Duration::seconds(61);
        let due = table.get_due_jobs(now, 25).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].job_type, "heartbeat_event");
    }
}

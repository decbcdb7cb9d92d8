//! `generate_summary`: calls the LLM collaborator and hands the result
//! off to a `send_message` job rather than delivering it directly,
//! mirroring the original's `generate_summary_job` -> `send_slack_message`
//! handoff.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::collab::LlmClient;
use crate::handler::JobHandler;
use crate::job::{JobTable, ScheduledJob};
use crate::kv::KvStore;

#[derive(Debug, Deserialize)]
pub struct GenerateSummaryPayload {
    pub user_id: String,
    pub prompt: String,
}

pub struct GenerateSummaryHandler<L, S> {
    llm: L,
    job_table: JobTable<S>,
}

impl<L: LlmClient, S: KvStore> GenerateSummaryHandler<L, S> {
    pub fn new(llm: L, job_table: JobTable<S>) -> Self {
        Self { llm, job_table }
    }
}

#[async_trait]
impl<L: LlmClient, S: KvStore + Send + Sync> JobHandler for GenerateSummaryHandler<L, S> {
    type Payload = GenerateSummaryPayload;

    async fn handle(&self, payload: GenerateSummaryPayload) -> Result<(), String> {
        let summary = self.llm.complete(&payload.prompt).await.map_err(|e| e.to_string())?;

        let now = Utc::now();
        let follow_up = ScheduledJob::new(
            "send_message",
            serde_json::json!({ "user_id": payload.user_id, "text": summary }),
            now,
            now,
        );
        self.job_table.put_job(&follow_up).await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::LlmError;
    use crate::mem_kv::MemoryKv;

    struct StubLlm(&'static str);

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            Err(LlmError("model unavailable".into()))
        }
    }

    #[tokio::test]
    async fn enqueues_a_send_message_job_carrying_the_completion() {
        let store = MemoryKv::new();
        let table = JobTable::new(store.clone());
        let handler = GenerateSummaryHandler::new(StubLlm("you shipped three things today"), JobTable::new(store));

        handler
            .handle(GenerateSummaryPayload { user_id: "U1".into(), prompt: "summarize today".into() })
            .await
            .unwrap();

        let due = table.get_due_jobs(Utc::now(), 25).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].job_type, "send_message");
        assert_eq!(due[0].payload["user_id"], "U1");
        assert_eq!(due[0].payload["text"], "you shipped three things today");
    }

    #[tokio::test]
    async fn llm_errors_surface_without_enqueuing_anything() {
        let store = MemoryKv::new();
        let table = JobTable::new(store.clone());
        let handler = GenerateSummaryHandler::new(FailingLlm, JobTable::new(store));

        let err = handler
            .handle(GenerateSummaryPayload { user_id: "U1".into(), prompt: "summarize today".into() })
            .await
            .unwrap_err();
        assert!(err.contains("model unavailable"));

        let due = table.get_due_jobs(Utc::now(), 25).await.unwrap();
        assert!(due.is_empty());
    }
}

//! Test harness for crates that build on `scheduler-core`: a fixture
//! builder for jobs and workers, a virtual clock, and in-memory
//! doubles for each collaborator trait in `scheduler_core::collab`.
//!
//! Kept as its own crate, not a `#[cfg(test)]` module of
//! `scheduler-core`, so that downstream consumers can depend on it as
//! a dev-dependency without pulling test-only code into their own
//! release builds.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use scheduler_core::collab::{
    ChatClient, ChatError, LlmClient, LlmError, SettingsError, TimezoneResolver, UserInfo,
    UserSettings, UserSettingsStore,
};
use scheduler_core::job::ScheduledJob;
use scheduler_core::mem_kv::MemoryKv;
use uuid::Uuid;

/// Builds [`ScheduledJob`] values with sensible defaults, letting a
/// test override only the fields it cares about.
pub struct JobFixture {
    job_type: String,
    payload: serde_json::Value,
    scheduled_for: DateTime<Utc>,
    now: DateTime<Utc>,
}

impl JobFixture {
    pub fn new(job_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_type: job_type.into(),
            payload: serde_json::json!({}),
            scheduled_for: now,
            now,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn scheduled_for(mut self, scheduled_for: DateTime<Utc>) -> Self {
        self.scheduled_for = scheduled_for;
        self
    }

    pub fn now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn build(self) -> ScheduledJob {
        ScheduledJob::new(self.job_type, self.payload, self.scheduled_for, self.now)
    }
}

/// A fresh, empty [`MemoryKv`] for a test, named for parity with
/// `JobFixture`/`ChatFixture` call sites even though it's a thin
/// wrapper today.
pub fn fresh_store() -> MemoryKv {
    MemoryKv::new()
}

/// Records every message a test sends through [`ChatClient`], for
/// assertions like "exactly one message went to this user".
#[derive(Default)]
pub struct RecordingChatClient {
    sent: Mutex<Vec<(String, String)>>,
    users: Mutex<HashMap<String, UserInfo>>,
}

impl RecordingChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a lookup result for `lookup_user`, e.g. a user's timezone.
    pub fn with_user(self, user_identity: impl Into<String>, info: UserInfo) -> Self {
        self.users
            .lock()
            .unwrap()
            .insert(user_identity.into(), info);
        self
    }

    pub fn sent_messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatClient for RecordingChatClient {
    async fn post_direct_message(&self, user_identity: &str, text: &str) -> Result<(), ChatError> {
        self.sent
            .lock()
            .unwrap()
            .push((user_identity.to_string(), text.to_string()));
        Ok(())
    }

    async fn lookup_user(&self, user_identity: &str) -> Result<UserInfo, ChatError> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .get(user_identity)
            .cloned()
            .unwrap_or_default())
    }
}

/// Returns a fixed completion for every prompt, or a configured error.
pub struct StubLlmClient {
    completion: Result<String, String>,
}

impl StubLlmClient {
    pub fn returning(completion: impl Into<String>) -> Self {
        Self {
            completion: Ok(completion.into()),
        }
    }

    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            completion: Err(error.into()),
        }
    }
}

#[async_trait]
impl LlmClient for StubLlmClient {
    async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        self.completion
            .clone()
            .map_err(LlmError)
    }
}

/// A fixed map of user identity to settings, for tests that don't need
/// a real settings backend.
#[derive(Default)]
pub struct StaticUserSettingsStore {
    settings: HashMap<String, UserSettings>,
}

impl StaticUserSettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timezone(mut self, user_identity: impl Into<String>, timezone: impl Into<String>) -> Self {
        self.settings.insert(
            user_identity.into(),
            UserSettings {
                timezone: Some(timezone.into()),
                extra: HashMap::new(),
            },
        );
        self
    }
}

#[async_trait]
impl UserSettingsStore for StaticUserSettingsStore {
    async fn get_user_settings(&self, user_identity: &str) -> Result<UserSettings, SettingsError> {
        Ok(self.settings.get(user_identity).cloned().unwrap_or_default())
    }
}

/// Resolves to a single fixed timezone regardless of the name passed
/// in, for tests that want deterministic local time without depending
/// on `chrono-tz`'s IANA parsing.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimezoneResolver(pub Tz);

impl TimezoneResolver for FixedTimezoneResolver {
    fn resolve(&self, _name: Option<&str>) -> Tz {
        self.0
    }
}

/// A correlation id generator that returns a preset sequence instead
/// of random UUIDs, for tests asserting on a handler's follow-up job.
pub struct SequentialUuids {
    next: Mutex<Vec<Uuid>>,
}

impl SequentialUuids {
    pub fn new(ids: impl IntoIterator<Item = Uuid>) -> Self {
        let mut ids: Vec<Uuid> = ids.into_iter().collect();
        ids.reverse();
        Self {
            next: Mutex::new(ids),
        }
    }

    pub fn next(&self) -> Uuid {
        self.next
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(Uuid::new_v4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_chat_client_captures_every_message() {
        let chat = RecordingChatClient::new();
        chat.post_direct_message("U1", "hello").await.unwrap();
        chat.post_direct_message("U2", "world").await.unwrap();

        assert_eq!(
            chat.sent_messages(),
            vec![
                ("U1".to_string(), "hello".to_string()),
                ("U2".to_string(), "world".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn stub_llm_client_returns_its_configured_completion() {
        let llm = StubLlmClient::returning("a summary");
        assert_eq!(llm.complete("anything").await.unwrap(), "a summary");
    }

    #[tokio::test]
    async fn stub_llm_client_surfaces_its_configured_failure() {
        let llm = StubLlmClient::failing("rate limited");
        let err = llm.complete("anything").await.unwrap_err();
        assert_eq!(err.0, "rate limited");
    }

    #[tokio::test]
    async fn static_user_settings_store_returns_empty_settings_for_unknown_user() {
        let store = StaticUserSettingsStore::new().with_timezone("U1", "America/Chicago");
        let settings = store.get_user_settings("U2").await.unwrap();
        assert_eq!(settings.timezone, None);
    }

    #[test]
    fn sequential_uuids_yields_preset_ids_in_order_then_falls_back_to_random() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let seq = SequentialUuids::new([a, b]);
        assert_eq!(seq.next(), a);
        assert_eq!(seq.next(), b);
        assert_ne!(seq.next(), Uuid::nil());
    }

    #[test]
    fn job_fixture_defaults_to_an_empty_payload_scheduled_now() {
        let job = JobFixture::new("heartbeat_event").build();
        assert_eq!(job.job_type, "heartbeat_event");
        assert_eq!(job.payload, serde_json::json!({}));
    }
}

//! `work_sampling_prompt`: nudges a user to log what they're doing.
//!
//! The prompt text itself is chosen uniformly at random at delivery
//! time; only the slot *time* the job was scheduled for is the
//! deterministic, seed-derived part (see `scheduler_loop`).

use async_trait::async_trait;
use serde::Deserialize;

use crate::collab::ChatClient;
use crate::handler::JobHandler;

pub const WORK_SAMPLING_PROMPTS: &[&str] = &[
    "What are you working on right now?",
    "Got a minute? Log what you're doing.",
    "Quick check-in: what's your focus at the moment?",
    "Still on track? Drop a note on what you're doing.",
    "Pause and reflect: what are you doing right now?",
];

#[derive(Debug, Deserialize)]
pub struct WorkSamplingPayload {
    pub user_id: String,
}

pub struct WorkSamplingHandler<C> {
    chat: C,
}

impl<C: ChatClient> WorkSamplingHandler<C> {
    pub fn new(chat: C) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl<C: ChatClient> JobHandler for WorkSamplingHandler<C> {
    type Payload = WorkSamplingPayload;

    async fn handle(&self, payload: WorkSamplingPayload) -> Result<(), String> {
        let prompt = WORK_SAMPLING_PROMPTS[fastrand::usize(..WORK_SAMPLING_PROMPTS.len())];
        self.chat
            .post_direct_message(&payload.user_id, prompt)
            .await
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{ChatError, UserInfo};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChat {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChatClient for RecordingChat {
        async fn post_direct_message(&self, user_identity: &str, text: &str) -> Result<(), ChatError> {
            self.sent.lock().unwrap().push((user_identity.to_string(), text.to_string()));
            Ok(())
        }

        async fn lookup_user(&self, _user_identity: &str) -> Result<UserInfo, ChatError> {
            Ok(UserInfo::default())
        }
    }

    #[tokio::test]
    async fn delivers_one_of_the_fixed_prompts_to_the_named_user() {
        let chat = RecordingChat::default();
        let handler = WorkSamplingHandler::new(chat);
        handler
            .handle(WorkSamplingPayload { user_id: "U1".into() })
            .await
            .unwrap();

        let sent = handler.chat.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "U1");
        assert!(WORK_SAMPLING_PROMPTS.contains(&sent[0].1.as_str()));
    }
}

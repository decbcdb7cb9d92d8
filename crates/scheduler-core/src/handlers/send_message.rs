//! `send_message`: delivers arbitrary text to a user identity. The
//! terminal handler in the `generate_summary` → `send_message` chain,
//! but also usable standalone.

use async_trait::async_trait;
use serde::Deserialize;

use crate::collab::ChatClient;
use crate::handler::JobHandler;

#[derive(Debug, Deserialize)]
pub struct SendMessagePayload {
    pub user_id: String,
    pub text: String,
}

pub struct SendMessageHandler<C> {
    chat: C,
}

impl<C: ChatClient> SendMessageHandler<C> {
    pub fn new(chat: C) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl<C: ChatClient> JobHandler for SendMessageHandler<C> {
    type Payload = SendMessagePayload;

    async fn handle(&self, payload: SendMessagePayload) -> Result<(), String> {
        self.chat
            .post_direct_message(&payload.user_id, &payload.text)
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

    struct FailingChat;

    #[async_trait]
    impl ChatClient for FailingChat {
        async fn post_direct_message(&self, _user_identity: &str, _text: &str) -> Result<(), ChatError> {
            Err(ChatError("rate limited".into()))
        }

        async fn lookup_user(&self, _user_identity: &str) -> Result<UserInfo, ChatError> {
            Ok(UserInfo::default())
        }
    }

    #[tokio::test]
    async fn delivers_the_payload_text_verbatim() {
        let chat = RecordingChat::default();
        let handler = SendMessageHandler::new(chat);
        handler
            .handle(SendMessagePayload { user_id: "U1".into(), text: "hello".into() })
            .await
            .unwrap();

        let sent = handler.chat.sent.lock().unwrap();
        assert_eq!(sent[0], ("U1".to_string(), "hello".to_string()));
    }

    #[tokio::test]
    async fn chat_client_errors_surface_as_handler_errors() {
        let handler = SendMessageHandler::new(FailingChat);
        let err = handler
            .handle(SendMessagePayload { user_id: "U1".into(), text: "hi".into() })
            .await
            .unwrap_err();
        assert!(err.contains("rate limited"));
    }
}

//! Traits for the external collaborators named in the system overview:
//! the chat client, the LLM client, the user-settings store, the
//! timezone resolver, and the observability sink. None of these are
//! implemented by this crate — they're the typed seams a caller plugs a
//! real chat/LLM/settings integration into.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("chat client error: {0}")]
pub struct ChatError(pub String);

#[derive(Debug, Error)]
#[error("llm client error: {0}")]
pub struct LlmError(pub String);

#[derive(Debug, Error)]
#[error("settings store error: {0}")]
pub struct SettingsError(pub String);

#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UserSettings {
    pub timezone: Option<String>,
    pub extra: HashMap<String, String>,
}

/// Delivers messages to a user identity in the chat integration.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn post_direct_message(&self, user_identity: &str, text: &str) -> Result<(), ChatError>;
    async fn lookup_user(&self, user_identity: &str) -> Result<UserInfo, ChatError>;
}

/// Produces text completions for the `generate_summary` handler.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Per-user settings, at minimum an IANA timezone name.
#[async_trait]
pub trait UserSettingsStore: Send + Sync {
    async fn get_user_settings(&self, user_identity: &str) -> Result<UserSettings, SettingsError>;
}

/// Resolves an IANA timezone name to a concrete offset function,
/// falling back to UTC for an unknown name.
pub trait TimezoneResolver: Send + Sync {
    fn resolve(&self, name: Option<&str>) -> Tz;
}

/// Default resolver: parses the IANA name via `chrono-tz`, falling
/// back to UTC on an unknown or absent name.
#[derive(Debug, Clone, Copy, Default)]
pub struct IanaTimezoneResolver;

impl TimezoneResolver for IanaTimezoneResolver {
    fn resolve(&self, name: Option<&str>) -> Tz {
        name.and_then(|n| n.parse::<Tz>().ok()).unwrap_or(Tz::UTC)
    }
}

/// Structured-error reporting sink. Job-processing failures are always
/// reported here with full job context before the worker records the
/// retry/dead-letter transition.
pub trait ObservabilitySink: Send + Sync {
    fn set_context(&self, name: &str, fields: &HashMap<String, String>);
    fn capture_exception(&self, error: &str);
}

/// `tracing`-backed default sink: emits a structured event per call
/// instead of forwarding to a vendor APM client.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObservabilitySink;

impl ObservabilitySink for TracingObservabilitySink {
    fn set_context(&self, name: &str, fields: &HashMap<String, String>) {
        tracing::debug!(context = name, ?fields, "observability context set");
    }

    fn capture_exception(&self, error: &str) {
        tracing::error!(error, "captured exception");
    }
}

//! The five built-in job handlers.
//!
//! None of these reach a real chat or LLM integration — they operate
//! purely against the [`crate::collab`] traits, so a caller wires in a
//! concrete Slack/LLM client to actually deliver anything.

pub mod daily_summary;
pub mod generate_summary;
pub mod heartbeat;
pub mod send_message;
pub mod work_sampling;

pub use daily_summary::{DailySummaryHandler, DailySummaryPayload};
pub use generate_summary::{GenerateSummaryHandler, GenerateSummaryPayload};
pub use heartbeat::{HeartbeatHandler, HeartbeatPayload};
pub use send_message::{SendMessageHandler, SendMessagePayload};
pub use work_sampling::{WorkSamplingHandler, WorkSamplingPayload, WORK_SAMPLING_PROMPTS};

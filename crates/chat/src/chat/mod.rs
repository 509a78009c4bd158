pub mod cancellation;
mod controller;
/// Stream routing and progress contracts between the ingestion task and the controller.
pub mod events;
pub mod ingest;
/// Conversation turns and the log that guards their mutation.
pub mod message;

pub use cancellation::{CancellationController, Generation, RequestToken};
pub use controller::{ChatController, ChatSnapshot, FALLBACK_MESSAGE, RequestProfile, TurnState};
pub use events::{StreamEvent, StreamEventPayload, StreamTarget, TurnOutcome, TurnProgress};
pub use ingest::IngestOutcome;
pub use message::{ConversationLog, LogError, LogResult, Role, Turn};

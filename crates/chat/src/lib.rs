#![deny(unsafe_code)]

/// Streaming conversation controller for the MediGraph triage service.
///
/// The controller owns the turn log, runs one triage request at a time and applies the
/// streamed answer to the log as it arrives. Rendering is left to the caller, which
/// reads [`chat::ChatSnapshot`] values.
pub mod chat;
pub mod session;
/// Client settings loaded from defaults, a JSON file and the environment.
pub mod settings;

pub use chat::{
    ChatController, ChatSnapshot, RequestProfile, Role, Turn, TurnOutcome, TurnProgress,
};
pub use session::{SessionId, start_session};
pub use settings::{ClientSettings, SettingsStore};

use std::fmt;
use std::str::FromStr;

use snafu::{ResultExt, Snafu};
use uuid::Uuid;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionIdError {
    #[snafu(display("session id '{raw}' is not a valid uuid"))]
    InvalidSessionId {
        stage: &'static str,
        raw: String,
        source: uuid::Error,
    },
}

/// Opaque identifier of one conversation, sent to the backend as `session_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn parse(raw: &str) -> Result<Self, SessionIdError> {
        let parsed = Uuid::parse_str(raw.trim()).context(InvalidSessionIdSnafu {
            stage: "parse-session-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }

    /// Underlying random UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<Uuid> for SessionId {
    fn from(value: Uuid) -> Self {
        Self::new(value)
    }
}

impl FromStr for SessionId {
    type Err = SessionIdError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

/// Mints a fresh random session identifier.
pub fn start_session() -> SessionId {
    SessionId(Uuid::new_v4())
}

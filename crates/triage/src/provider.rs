use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Triage endpoint used when nothing else is configured.
pub const DEFAULT_TRIAGE_ENDPOINT: &str = "http://localhost:8000/triage";

/// Caller identity sent with every request.
pub const DEFAULT_USER_ID: &str = "web_user";

/// Patient history placeholder sent when the user has not provided one.
pub const DEFAULT_HISTORY: &str = "None provided";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageConfig {
    pub endpoint: String,
    pub connect_timeout: Duration,
    /// Upper bound for waiting on response headers and for the gap between body chunks.
    pub read_timeout: Duration,
}

impl TriageConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TRIAGE_ENDPOINT)
    }
}

/// JSON body of one triage call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageRequest {
    pub symptoms: String,
    pub history: String,
    pub session_id: String,
    pub user_id: String,
}

impl TriageRequest {
    pub fn new(symptoms: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            symptoms: symptoms.into(),
            history: DEFAULT_HISTORY.to_string(),
            session_id: session_id.into(),
            user_id: DEFAULT_USER_ID.to_string(),
        }
    }

    pub fn with_history(mut self, history: impl Into<String>) -> Self {
        self.history = history.into();
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ChunkStream = Pin<Box<dyn Stream<Item = TriageResult<Bytes>> + Send + 'static>>;
pub type TriageResult<T> = Result<T, TriageError>;

/// Coarse failure class used by callers to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The call never produced a usable response body.
    Transport,
    /// The body broke off or could not be decoded mid-stream.
    Stream,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TriageError {
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to '{endpoint}' failed on `{stage}`, {source}"))]
    Connect {
        stage: &'static str,
        endpoint: String,
        source: reqwest::Error,
    },
    #[snafu(display("no response from '{endpoint}' within {timeout:?}"))]
    ResponseTimeout {
        stage: &'static str,
        endpoint: String,
        timeout: Duration,
    },
    #[snafu(display("triage endpoint returned status {status}: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to read response body on `{stage}`, {source}"))]
    ReadBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("response body stalled for more than {timeout:?}"))]
    ReadTimeout {
        stage: &'static str,
        timeout: Duration,
    },
    #[snafu(display("response body is not valid UTF-8 at byte {offset}"))]
    Decode { stage: &'static str, offset: usize },
    #[snafu(display("response body ended inside a UTF-8 sequence ({pending} bytes pending)"))]
    TruncatedUtf8 { stage: &'static str, pending: usize },
}

impl TriageError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::BuildClient { .. }
            | Self::Connect { .. }
            | Self::ResponseTimeout { .. }
            | Self::Status { .. } => FailureKind::Transport,
            Self::ReadBody { .. }
            | Self::ReadTimeout { .. }
            | Self::Decode { .. }
            | Self::TruncatedUtf8 { .. } => FailureKind::Stream,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::BuildClient { stage, .. }
            | Self::Connect { stage, .. }
            | Self::ResponseTimeout { stage, .. }
            | Self::Status { stage, .. }
            | Self::ReadBody { stage, .. }
            | Self::ReadTimeout { stage, .. }
            | Self::Decode { stage, .. }
            | Self::TruncatedUtf8 { stage, .. } => stage,
        }
    }
}

/// Seam between the conversation controller and whatever serves triage answers.
///
/// `open_stream` resolves once response headers arrived with a success status; the
/// returned stream then yields raw body chunks in arrival order.
pub trait TriageBackend: Send + Sync {
    fn endpoint(&self) -> &str;
    fn open_stream<'a>(
        &'a self,
        request: &'a TriageRequest,
    ) -> BoxFuture<'a, TriageResult<ChunkStream>>;
}

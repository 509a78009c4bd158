use std::sync::Arc;

mod decoder;
mod http_backend;
mod provider;

pub use decoder::Utf8ChunkDecoder;
pub use http_backend::HttpTriageBackend;
pub use provider::{
    BoxFuture, ChunkStream, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HISTORY, DEFAULT_READ_TIMEOUT,
    DEFAULT_TRIAGE_ENDPOINT, DEFAULT_USER_ID, FailureKind, TriageBackend, TriageConfig,
    TriageError, TriageRequest, TriageResult,
};

pub fn create_backend(config: TriageConfig) -> TriageResult<Arc<dyn TriageBackend>> {
    Ok(Arc::new(HttpTriageBackend::new(config)?))
}

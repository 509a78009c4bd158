use std::time::Duration;

use futures::{Stream, StreamExt};
use snafu::{IntoError, ResultExt};

use super::provider::{
    BoxFuture, BuildClientSnafu, ChunkStream, ConnectSnafu, ReadBodySnafu, ReadTimeoutSnafu,
    ResponseTimeoutSnafu, StatusSnafu, TriageBackend, TriageConfig, TriageRequest, TriageResult,
};

/// Upper bound on how much of a rejected response body is kept for the error.
const MAX_ERROR_BODY_BYTES: usize = 2048;

type BodyStream = std::pin::Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

/// Triage backend reached over plain HTTP with a chunked text response.
pub struct HttpTriageBackend {
    config: TriageConfig,
    client: reqwest::Client,
}

impl HttpTriageBackend {
    pub fn new(config: TriageConfig) -> TriageResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-client",
            })?;

        Ok(Self { config, client })
    }

    async fn send(&self, request: &TriageRequest) -> TriageResult<reqwest::Response> {
        let endpoint = self.config.endpoint.as_str();
        let pending = self.client.post(endpoint).json(request).send();

        let response = match tokio::time::timeout(self.config.read_timeout, pending).await {
            Ok(result) => result.context(ConnectSnafu {
                stage: "send-triage-request",
                endpoint: endpoint.to_string(),
            })?,
            Err(_) => {
                return ResponseTimeoutSnafu {
                    stage: "await-response-headers",
                    endpoint: endpoint.to_string(),
                    timeout: self.config.read_timeout,
                }
                .fail();
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = read_error_body(response, self.config.read_timeout).await;
            tracing::warn!(
                endpoint = %endpoint,
                status = status.as_u16(),
                "triage endpoint rejected request"
            );
            return StatusSnafu {
                stage: "check-response-status",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        Ok(response)
    }

    fn chunk_stream(response: reqwest::Response, read_timeout: Duration) -> ChunkStream {
        let body: BodyStream = Box::pin(response.bytes_stream());

        // The stream ends for good after the first error so callers never see
        // chunks from a body that already failed.
        let chunks = futures::stream::unfold(Some(body), move |state| async move {
            let mut body = state?;
            let next = match tokio::time::timeout(read_timeout, body.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let error = ReadTimeoutSnafu {
                        stage: "read-body-chunk",
                        timeout: read_timeout,
                    }
                    .build();
                    return Some((Err(error), None));
                }
            };

            match next? {
                Ok(bytes) => Some((Ok(bytes), Some(body))),
                Err(source) => {
                    let error = ReadBodySnafu {
                        stage: "read-body-chunk",
                    }
                    .into_error(source);
                    Some((Err(error), None))
                }
            }
        });

        Box::pin(chunks)
    }
}

/// Collects at most [`MAX_ERROR_BODY_BYTES`] of a rejected response within `read_timeout`.
///
/// A body that stalls, breaks off or runs long is cut short; the status is what matters.
async fn read_error_body(response: reqwest::Response, read_timeout: Duration) -> String {
    let mut body: BodyStream = Box::pin(response.bytes_stream());
    let mut collected = Vec::new();

    let read = async {
        while let Some(Ok(chunk)) = body.next().await {
            let remaining = MAX_ERROR_BODY_BYTES - collected.len();
            collected.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
            if collected.len() >= MAX_ERROR_BODY_BYTES {
                break;
            }
        }
    };

    if tokio::time::timeout(read_timeout, read).await.is_err() {
        tracing::debug!(
            timeout_ms = read_timeout.as_millis() as u64,
            bytes = collected.len(),
            "error body stalled, keeping what arrived"
        );
    }

    String::from_utf8_lossy(&collected).into_owned()
}

impl TriageBackend for HttpTriageBackend {
    fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn open_stream<'a>(
        &'a self,
        request: &'a TriageRequest,
    ) -> BoxFuture<'a, TriageResult<ChunkStream>> {
        Box::pin(async move {
            tracing::debug!(
                endpoint = %self.config.endpoint,
                session_id = %request.session_id,
                symptom_chars = request.symptoms.chars().count(),
                "opening triage stream"
            );

            let response = self.send(request).await?;
            Ok(Self::chunk_stream(response, self.config.read_timeout))
        })
    }
}

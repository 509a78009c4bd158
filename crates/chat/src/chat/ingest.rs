use futures::StreamExt;
use medigraph_triage::{TriageBackend, TriageRequest, TriageResult, Utf8ChunkDecoder};

use crate::chat::cancellation::RequestToken;

/// Non-error ways an ingestion run can end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Completed,
    Cancelled,
}

/// Opens one triage stream and feeds decoded text to `sink` until the body ends.
///
/// `token` is checked before the request is opened, before every chunk read and before
/// every `sink` call. Once it is dead nothing more is read or written and the run ends
/// with [`IngestOutcome::Cancelled`]. Pending connects and reads are raced against the
/// token so a stop does not wait for the next chunk to arrive.
pub async fn run<S>(
    backend: &dyn TriageBackend,
    request: &TriageRequest,
    token: &RequestToken,
    mut sink: S,
) -> TriageResult<IngestOutcome>
where
    S: FnMut(String),
{
    if !token.is_live() {
        return Ok(IngestOutcome::Cancelled);
    }

    let mut chunks = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(IngestOutcome::Cancelled),
        opened = backend.open_stream(request) => opened?,
    };

    let mut decoder = Utf8ChunkDecoder::new();
    let mut chunk_count = 0usize;

    loop {
        if !token.is_live() {
            return Ok(IngestOutcome::Cancelled);
        }

        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(IngestOutcome::Cancelled),
            next = chunks.next() => next,
        };

        let Some(chunk) = next else {
            decoder.finish()?;
            tracing::debug!(
                generation = token.generation().0,
                chunk_count,
                bytes = decoder.bytes_decoded(),
                "triage stream finished"
            );
            return Ok(IngestOutcome::Completed);
        };

        let text = decoder.decode(&chunk?)?;
        chunk_count += 1;
        if text.is_empty() {
            // Only a partial character so far; it completes with a later chunk.
            continue;
        }

        if !token.is_live() {
            return Ok(IngestOutcome::Cancelled);
        }
        sink(text);
    }
}

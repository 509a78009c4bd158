use super::provider::{DecodeSnafu, TriageResult, TruncatedUtf8Snafu};

/// Incremental UTF-8 decoder for a chunked response body.
///
/// Chunk boundaries are arbitrary, so a multi-byte character may arrive split across
/// two reads. The incomplete tail is held back until the next chunk completes it.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
    consumed: usize,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes as much of `chunk` (plus any held-back bytes) as forms complete characters.
    pub fn decode(&mut self, chunk: &[u8]) -> TriageResult<String> {
        self.pending.extend_from_slice(chunk);

        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(error) => {
                if error.error_len().is_some() {
                    return DecodeSnafu {
                        stage: "decode-chunk",
                        offset: self.consumed + error.valid_up_to(),
                    }
                    .fail();
                }
                error.valid_up_to()
            }
        };

        // The prefix up to `valid_up_to` is known-good, so the lossy path never substitutes.
        let text = String::from_utf8_lossy(&self.pending[..valid_up_to]).into_owned();
        self.pending.drain(..valid_up_to);
        self.consumed += valid_up_to;
        Ok(text)
    }

    /// Verifies that the body did not end in the middle of a character.
    pub fn finish(&mut self) -> TriageResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let pending = self.pending.len();
        self.pending.clear();
        TruncatedUtf8Snafu {
            stage: "finish-decode",
            pending,
        }
        .fail()
    }

    pub fn bytes_decoded(&self) -> usize {
        self.consumed
    }
}

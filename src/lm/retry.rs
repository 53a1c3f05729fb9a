use super::{CompletionOptions, TextGenerator};
use crate::error::ProviderError;
use std::time::Duration;

/// Retries transient provider failures with linear backoff.
///
/// Auth and quota failures are returned immediately.
pub struct RetryingGenerator<G> {
    inner: G,
    retries: u32,
    backoff: Duration,
}

impl<G: TextGenerator> RetryingGenerator<G> {
    pub fn new(inner: G, retries: u32, backoff: Duration) -> Self {
        Self {
            inner,
            retries,
            backoff,
        }
    }
}

impl<G: TextGenerator> TextGenerator for RetryingGenerator<G> {
    fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(prompt, options) {
                Ok(text) => return Ok(text),
                Err(err) if err.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        retries = self.retries,
                        error = %err,
                        "transient provider failure, retrying"
                    );
                    std::thread::sleep(self.backoff * attempt);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn name(&self) -> String {
        self.inner.name()
    }
}

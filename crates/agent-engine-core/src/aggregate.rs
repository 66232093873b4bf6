//! Reduction of a fragment stream into reply text.

use futures::{Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;

use crate::{Fragment, traits::RemoteError};

/// Reduced form of a fragment sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatedResponse {
    /// Concatenation of every text contribution in arrival order.
    pub text: String,
    /// Whether the sequence ran to its end.
    pub complete: bool,
    /// Fragments consumed, including unknown ones.
    pub fragments: usize,
    /// Fragments skipped because their shape was not recognised.
    pub unknown_fragments: usize,
}

/// Failure while consuming a fragment stream.
///
/// Text accumulated before the failure is kept in `partial`.
#[derive(Debug, Error)]
#[error("Stream error: {source}")]
pub struct StreamError {
    pub partial: AggregatedResponse,
    #[source]
    pub source: RemoteError,
}

/// Incremental fragment reducer.
#[derive(Debug, Default)]
pub struct Aggregator {
    response: AggregatedResponse,
}

impl Aggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Text accumulated so far.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.response.text
    }

    /// Fold one fragment in, calling `observer` after every text append.
    pub fn push<F>(&mut self, fragment: Fragment, observer: &mut F)
    where
        F: FnMut(&str) + ?Sized,
    {
        self.response.fragments += 1;
        match fragment {
            Fragment::TextEvent { parts } => {
                for text in parts.into_iter().filter_map(|part| part.text) {
                    self.response.text.push_str(&text);
                    observer(&self.response.text);
                }
            }
            Fragment::RawText(text) => {
                self.response.text.push_str(&text);
                observer(&self.response.text);
            }
            Fragment::Unknown(value) => {
                self.response.unknown_fragments += 1;
                tracing::debug!(event = %value, "Skipping unrecognised fragment");
            }
        }
    }

    /// Mark the sequence exhausted.
    #[must_use]
    pub fn finish(mut self) -> AggregatedResponse {
        self.response.complete = true;
        self.response
    }

    /// Stop on an error, keeping the partial text.
    #[must_use]
    pub fn fail(self, source: RemoteError) -> StreamError {
        StreamError {
            partial: self.response,
            source,
        }
    }
}

/// Drive a fragment stream to completion.
///
/// # Errors
/// Returns [`StreamError`] with the partial text if the stream yields an error.
pub async fn aggregate<S, F>(stream: S, mut observer: F) -> Result<AggregatedResponse, StreamError>
where
    S: Stream<Item = Result<Fragment, RemoteError>>,
    F: FnMut(&str),
{
    futures::pin_mut!(stream);
    let mut aggregator = Aggregator::new();

    while let Some(next) = stream.next().await {
        match next {
            Ok(fragment) => aggregator.push(fragment, &mut observer),
            Err(e) => return Err(aggregator.fail(e)),
        }
    }

    Ok(aggregator.finish())
}

use std::fmt;

use crate::api::ApiError;

/// Why a completion or page was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// A page arrived that does not directly follow the last appended one.
    PageOutOfOrder { expected: u32, received: u32 },
    /// The feed was reset or disposed after the request was issued.
    Superseded,
    /// The mutation record is gone, or a newer mutation on the same post
    /// already settled it.
    MutationSuperseded { post_id: String, sequence: u64 },
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::PageOutOfOrder { expected, received } => {
                write!(f, "expected page {}, received page {}", expected, received)
            }
            StaleReason::Superseded => write!(f, "feed was reset since the request"),
            StaleReason::MutationSuperseded { post_id, sequence } => {
                write!(f, "mutation #{} on {} was superseded", sequence, post_id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("stale response: {0}")]
    StaleResponse(StaleReason),
    #[error("rejected by server: {0}")]
    Conflict(String),
    #[error("sign in to interact with posts")]
    NotSignedIn,
    #[error("post {id} is not in the feed")]
    UnknownPost { id: String },
}

impl FeedError {
    /// Whether retrying the same action by hand can reasonably succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, FeedError::Network(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, FeedError::StaleResponse(_))
    }
}

impl From<ApiError> for FeedError {
    fn from(err: ApiError) -> Self {
        if err.is_rejection() {
            FeedError::Conflict(err.to_string())
        } else {
            FeedError::Network(err.to_string())
        }
    }
}

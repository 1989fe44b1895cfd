pub mod backoff;
pub mod coverage;
pub mod dispatcher;
pub mod engine;
mod error;
pub mod fetch;
pub mod job;
pub mod range;
pub mod rate_limit;
pub mod store;

pub use error::SyncError;

/// Stream served by the remote conversation search.
pub const CONVERSATIONS: &str = "conversations";

pub(crate) fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

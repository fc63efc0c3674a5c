pub mod annotated;
pub mod api_types;
pub mod cached_client;
pub mod client;
pub mod types;

pub use annotated::{Annotated, Meta, Remark};
pub use cached_client::CachedSentryClient;
pub use client::SentryClient;
pub use types::{IssueStatus, IssueSummary};

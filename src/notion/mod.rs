//! Notion API client

pub mod client;
pub mod errors;
pub mod types;

pub use client::NotionClient;
pub use errors::UpstreamError;
pub use types::*;

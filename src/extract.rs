//! Document extraction, provided by whatever hosts the pages.
//!
//! The broker only forwards these calls; it never looks inside the results.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BrokerError;

#[async_trait]
pub trait PageExtractor: Send + Sync {
    /// Text and metadata of the current page.
    async fn get_text(&self, options: Value) -> Result<Value, BrokerError>;

    /// Reader-mode content. Without `force`, returns `None` for pages that
    /// are not readerable.
    async fn get_reader_mode_content(&self, force: bool) -> Result<Option<String>, BrokerError>;

    /// Pagination metadata, if the page has any.
    async fn get_page_info(&self, options: Value) -> Result<Option<Value>, BrokerError>;

    async fn get_selection_text(&self) -> Result<String, BrokerError>;

    /// Load `url` in a hidden page and extract its text.
    async fn get_headless_page_text(&self, url: &str, options: Value) -> Result<Value, BrokerError>;
}

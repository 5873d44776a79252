use std::future::Future;

use sha2::{Digest, Sha256};
use unitscout_core::AppError;

/// A rendered unit page handed over for extraction.
#[derive(Debug, Clone)]
pub struct UnitPage {
    pub university_id: String,
    pub unit_code: String,
    pub url: String,
    pub title: String,
    pub html: String,
}

impl UnitPage {
    pub fn content_hash(&self) -> String {
        compute_hash(&self.html)
    }
}

/// Destination of scraped unit pages.
pub trait PageSink: Send + Sync {
    fn accept(&self, page: UnitPage) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Sink that logs a content fingerprint of each page and discards it.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashLoggingSink;

impl PageSink for HashLoggingSink {
    async fn accept(&self, page: UnitPage) -> Result<(), AppError> {
        tracing::info!(
            university_id = %page.university_id,
            unit_code = %page.unit_code,
            url = %page.url,
            bytes = page.html.len(),
            hash = %page.content_hash(),
            "Unit page scraped"
        );
        Ok(())
    }
}

/// SHA-256 hex digest.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

//! Publishing rendered PDFs to a static site.

pub mod pages;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::PublishError;
use crate::mail::message::DeliveryMetadata;

/// Where a published PDF ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPdf {
    /// File name inside the site's `pdfs/` directory.
    pub filename: String,
    pub path: PathBuf,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Copy `pdf` into the site, record it in the index and publish.
    async fn publish(
        &self,
        pdf: &Path,
        metadata: &DeliveryMetadata,
    ) -> Result<PublishedPdf, PublishError>;

    /// Public URL of the site, for logs and messages.
    fn page_url(&self) -> &str;
}

//! Document primitives behind a black-box engine contract.
//!
//! The pipeline never manipulates PDF internals itself; it asks a
//! [`DocumentEngine`] for page counts, text, page images, and split
//! output. The bundled [`lopdf_engine::LopdfEngine`] covers counting,
//! splitting, and text extraction; deployments that need page
//! rasterization plug in an engine that implements [`DocumentEngine::render_pages`].
//!
//! All operations are synchronous and CPU-bound; stage handlers run them
//! on the blocking thread pool.

use crate::types::PageRange;

pub mod lopdf_engine;

/// Errors from document operations.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// The bytes are not a readable document.
    #[error("document could not be parsed: {0}")]
    Malformed(String),
    /// A requested page is outside the document.
    #[error("page out of range: {0}")]
    PageOutOfRange(String),
    /// Text extraction failed.
    #[error("text extraction failed: {0}")]
    Extraction(String),
    /// The engine does not implement this operation.
    #[error("operation not supported by this document engine: {0}")]
    Unsupported(&'static str),
}

/// A rendered page, ready for a vision model.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// Zero-indexed page number.
    pub page_index: i64,
    /// Image MIME type.
    pub mime_type: String,
    /// Encoded image bytes.
    pub data: Vec<u8>,
}

/// The external document-processing contract.
pub trait DocumentEngine: Send + Sync {
    /// Number of pages in the document.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Malformed`] for unreadable bytes.
    fn page_count(&self, bytes: &[u8]) -> Result<i64, DocumentError>;

    /// Extract all text, pages concatenated in order.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError`] when the document cannot be read.
    fn extract_text(&self, bytes: &[u8]) -> Result<String, DocumentError>;

    /// Produce a new document containing only `range` (zero-indexed,
    /// inclusive).
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::PageOutOfRange`] when `range` exceeds the
    /// document.
    fn split(&self, bytes: &[u8], range: PageRange) -> Result<Vec<u8>, DocumentError>;

    /// Render the given zero-indexed pages as images, in the given order.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Unsupported`] from engines without a
    /// rasterizer.
    fn render_pages(&self, bytes: &[u8], pages: &[i64]) -> Result<Vec<PageImage>, DocumentError>;
}

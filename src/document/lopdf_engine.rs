//! Default document engine backed by `lopdf` and `pdf-extract`.
//!
//! Handles page counting, page-range splitting, and text extraction.
//! Rasterization is not implemented here; providers that accept native
//! PDFs don't need it, and deployments that do rasterize swap in their
//! own engine.

use lopdf::Document;

use crate::types::PageRange;

use super::{DocumentEngine, DocumentError, PageImage};

/// `lopdf`/`pdf-extract` backed engine.
#[derive(Debug, Clone, Default)]
pub struct LopdfEngine;

impl LopdfEngine {
    /// Create the engine.
    pub fn new() -> Self {
        Self
    }

    fn load(bytes: &[u8]) -> Result<Document, DocumentError> {
        Document::load_mem(bytes).map_err(|e| DocumentError::Malformed(e.to_string()))
    }
}

impl DocumentEngine for LopdfEngine {
    fn page_count(&self, bytes: &[u8]) -> Result<i64, DocumentError> {
        let doc = Self::load(bytes)?;
        Ok(i64::try_from(doc.get_pages().len()).unwrap_or(i64::MAX))
    }

    fn extract_text(&self, bytes: &[u8]) -> Result<String, DocumentError> {
        pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| DocumentError::Extraction(e.to_string()))
    }

    fn split(&self, bytes: &[u8], range: PageRange) -> Result<Vec<u8>, DocumentError> {
        let mut doc = Self::load(bytes)?;
        let total = i64::try_from(doc.get_pages().len()).unwrap_or(i64::MAX);
        if range.start < 0 || range.end < range.start || range.end >= total {
            return Err(DocumentError::PageOutOfRange(format!(
                "range [{}, {}] in a {total}-page document",
                range.start, range.end
            )));
        }

        // lopdf numbers pages from 1; the range is zero-indexed.
        let keep_from = range.start.saturating_add(1);
        let keep_to = range.end.saturating_add(1);
        let delete: Vec<u32> = (1..=total)
            .filter(|page| *page < keep_from || *page > keep_to)
            .filter_map(|page| u32::try_from(page).ok())
            .collect();
        if !delete.is_empty() {
            doc.delete_pages(&delete);
        }
        doc.prune_objects();

        let mut out = Vec::new();
        doc.save_to(&mut out)
            .map_err(|e| DocumentError::Malformed(e.to_string()))?;
        Ok(out)
    }

    fn render_pages(&self, _bytes: &[u8], _pages: &[i64]) -> Result<Vec<PageImage>, DocumentError> {
        Err(DocumentError::Unsupported("page rasterization"))
    }
}

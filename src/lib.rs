//! partsmith — Smart Upload pipeline for music-score documents.
//!
//! Uploaded score PDFs move through a staged, asynchronous pipeline:
//! text extraction, vision-LLM metadata extraction, split planning,
//! per-instrument splitting, second-pass verification, adjudication,
//! finalization, and — when quality gates pass — autonomous catalog
//! ingestion. Cleanup is a terminal branch reachable from any stage.

pub mod cancel;
pub mod config;
pub mod document;
pub mod llm;
pub mod logging;
pub mod ops;
pub mod pipeline;
pub mod storage;
pub mod types;

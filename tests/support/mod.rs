//! Shared fixtures for integration tests: a scripted LLM transport, a
//! deterministic fake document engine, and a synchronous job driver.
//!
//! Each test harness uses a different subset of these.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use partsmith::cancel::Cancellation;
use partsmith::document::{DocumentEngine, DocumentError, PageImage};
use partsmith::llm::dispatcher::{Transport, TransportError, TransportResponse};
use partsmith::llm::PreparedRequest;
use partsmith::pipeline::engine::PipelineEngine;
use partsmith::pipeline::queue::JobHandler;
use partsmith::pipeline::JobPayload;
use partsmith::types::PageRange;

// ── Scripted transport ──────────────────────────────────────────

/// Returns canned outcomes in order and records every request.
pub struct ScriptedTransport {
    script: Mutex<Vec<Result<TransportResponse, TransportError>>>,
    pub attempts: AtomicUsize,
    pub requests: Mutex<Vec<PreparedRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            attempts: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(
        &self,
        request: &PreparedRequest,
        _timeout: Duration,
        _cancel: &Cancellation,
    ) -> Result<TransportResponse, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("test lock")
            .push(request.clone());
        let mut script = self.script.lock().expect("test lock");
        if script.is_empty() {
            return Err(TransportError::Io("script exhausted".to_owned()));
        }
        script.remove(0)
    }
}

/// A 200 chat-completions response whose assistant content is `payload`
/// serialized as a JSON string.
pub fn llm_json_response(payload: &Value) -> Result<TransportResponse, TransportError> {
    let body = serde_json::json!({
        "choices": [{
            "message": {"role": "assistant", "content": payload.to_string()},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 100, "completion_tokens": 50}
    });
    Ok(TransportResponse {
        status: 200,
        body: body.to_string(),
    })
}

// ── Fake document engine ────────────────────────────────────────

/// Documents are byte strings of the form `PAGES:<n>`; splits produce
/// the same shape so page counts stay consistent downstream.
#[derive(Debug, Default)]
pub struct FakeDocumentEngine;

pub fn fake_pdf(pages: i64) -> Vec<u8> {
    format!("PAGES:{pages}").into_bytes()
}

impl FakeDocumentEngine {
    fn pages(bytes: &[u8]) -> Result<i64, DocumentError> {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.strip_prefix("PAGES:"))
            .and_then(|n| n.parse::<i64>().ok())
            .ok_or_else(|| DocumentError::Malformed("not a fake pdf".to_owned()))
    }
}

impl DocumentEngine for FakeDocumentEngine {
    fn page_count(&self, bytes: &[u8]) -> Result<i64, DocumentError> {
        Self::pages(bytes)
    }

    fn extract_text(&self, bytes: &[u8]) -> Result<String, DocumentError> {
        let pages = Self::pages(bytes)?;
        Ok(format!("Sheet music text across {pages} pages"))
    }

    fn split(&self, bytes: &[u8], range: PageRange) -> Result<Vec<u8>, DocumentError> {
        let total = Self::pages(bytes)?;
        if range.start < 0 || range.end < range.start || range.end >= total {
            return Err(DocumentError::PageOutOfRange(format!(
                "[{}, {}] of {total}",
                range.start, range.end
            )));
        }
        Ok(fake_pdf(range.len()))
    }

    fn render_pages(&self, bytes: &[u8], pages: &[i64]) -> Result<Vec<PageImage>, DocumentError> {
        let total = Self::pages(bytes)?;
        pages
            .iter()
            .map(|page| {
                if *page < 0 || *page >= total {
                    return Err(DocumentError::PageOutOfRange(page.to_string()));
                }
                Ok(PageImage {
                    page_index: *page,
                    mime_type: "image/png".to_owned(),
                    data: vec![0x89, 0x50, 0x4e, 0x47],
                })
            })
            .collect()
    }
}

// ── Synchronous job driver ──────────────────────────────────────

/// Drive jobs to completion the way the queue would, but synchronously:
/// retry retryable failures up to three attempts, then hand the job to
/// `on_exhausted` and keep going with whatever follow-ups come back.
pub async fn drive(engine: &Arc<PipelineEngine>, initial: Vec<JobPayload>) {
    let mut jobs: VecDeque<JobPayload> = initial.into();
    let mut steps: usize = 0;
    while let Some(job) = jobs.pop_front() {
        steps = steps.saturating_add(1);
        assert!(steps < 100, "job loop did not converge");

        let mut attempt: u32 = 1;
        loop {
            match engine.handle(&job).await {
                Ok(followups) => {
                    jobs.extend(followups);
                    break;
                }
                Err(error) if error.is_retryable() && attempt < 3 => {
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => {
                    jobs.extend(engine.on_exhausted(&job, &error).await);
                    break;
                }
            }
        }
    }
}

//! Rate limiting through the full dispatcher path.

use std::sync::Arc;
use std::time::Duration;

use partsmith::cancel::Cancellation;
use partsmith::llm::dispatcher::{DispatchOptions, Dispatcher, TransportResponse};
use partsmith::llm::provider::{AdapterConfig, Provider};
use partsmith::llm::rate_limit::RateLimiter;
use partsmith::llm::VisionRequest;
use tokio::time::Instant;

use crate::support::ScriptedTransport;

fn ok_response() -> TransportResponse {
    let body = serde_json::json!({
        "choices": [{"message": {"role": "assistant", "content": "{}"}}]
    });
    TransportResponse {
        status: 200,
        body: body.to_string(),
    }
}

/// Seven instantaneous calls at RPM 6: the first six go straight
/// through, the seventh waits at least one 10-second refill.
#[tokio::test(start_paused = true)]
async fn seventh_call_at_rpm_six_waits_for_a_refill() {
    let transport = ScriptedTransport::new((0..7).map(|_| Ok(ok_response())).collect());
    let limiter = Arc::new(RateLimiter::new(6));
    let dispatcher = Arc::new(Dispatcher::with_transport(transport.clone(), limiter));

    let options = DispatchOptions {
        rpm: 6,
        ..DispatchOptions::default()
    };
    let config = AdapterConfig::with_defaults(Provider::OpenAi, Some("k".to_owned()));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..7 {
        let dispatcher = Arc::clone(&dispatcher);
        let config = config.clone();
        let options = options.clone();
        handles.push(tokio::spawn(async move {
            let mut request = VisionRequest::new("p");
            dispatcher
                .call_vision_model(&config, &mut request, &options, &Cancellation::none())
                .await
                .expect("call succeeds");
            Instant::now()
        }));
    }

    let mut finish_times = Vec::new();
    for handle in handles {
        finish_times.push(handle.await.expect("join"));
    }
    finish_times.sort();

    assert_eq!(transport.attempts(), 7);
    // Six immediate starts...
    assert!(finish_times[5].duration_since(start) < Duration::from_secs(10));
    // ...and the seventh waited a full refill interval.
    assert!(finish_times[6].duration_since(start) >= Duration::from_secs(10));
}

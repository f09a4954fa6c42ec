//! Shared fixtures: a scripted transport and a recording metrics sink.
#![allow(dead_code)]

use async_trait::async_trait;
use roadcast::{
    ApiService, MetricsSink, RoadcastConfig, TrackedCall, Transport, UpstreamError,
    UpstreamRequest, UpstreamResponse,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const WEATHER_URL: &str = "https://api.open-meteo.com/v1/forecast?latitude=52.52";
pub const TRAFFIC_URL: &str = "https://api.tomtom.com/traffic/services/4/flow";

/// What the mock answers with.
#[derive(Debug, Clone)]
pub enum Reply {
    Json(Value),
    /// Successful answer with a specific 2xx status.
    Status(u16, Value),
    Fail(UpstreamError),
}

impl Reply {
    pub fn server_error() -> Self {
        Reply::Fail(UpstreamError::Status {
            status: 503,
            message: "service unavailable".into(),
        })
    }
}

/// Transport that replays scripted replies, then falls back to echoing the
/// URL. Every call can be delayed, which with paused time keeps it in flight
/// until the test advances the clock.
#[derive(Debug)]
pub struct MockTransport {
    script: Mutex<VecDeque<Reply>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn fail_times(&self, n: usize, reply: Reply) {
        for _ in 0..n {
            self.push(reply.clone());
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// URLs in the order their calls started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(request.url.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let reply = self.script.lock().unwrap().pop_front();
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match reply {
            Some(Reply::Json(value)) => Ok(UpstreamResponse::ok(value)),
            Some(Reply::Status(status, body)) => Ok(UpstreamResponse { status, body }),
            Some(Reply::Fail(err)) => Err(err),
            None => Ok(UpstreamResponse::ok(
                json!({ "url": request.url, "headers": request.headers }),
            )),
        }
    }
}

/// Metrics sink that keeps every event.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    calls: Mutex<Vec<TrackedCall>>,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TrackedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl MetricsSink for RecordingMetrics {
    fn track_call(&self, call: &TrackedCall) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(call.clone());
        Ok(())
    }
}

pub struct Harness {
    pub service: Arc<ApiService>,
    pub transport: Arc<MockTransport>,
    pub metrics: Arc<RecordingMetrics>,
}

pub fn harness(config: RoadcastConfig) -> Harness {
    let transport = MockTransport::new();
    let metrics = RecordingMetrics::new();
    let service = ApiService::builder(config)
        .with_transport(transport.clone())
        .with_metrics(metrics.clone())
        .build()
        .expect("service builds");
    Harness {
        service: Arc::new(service),
        transport,
        metrics,
    }
}

/// Yield until `cond` holds. Panics after a generous number of rounds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

//! Breaker behaviour observed through `fetch`.

mod common;

use common::{harness, Harness, Reply, TRAFFIC_URL, WEATHER_URL};
use roadcast::{
    ApiError, CategoryConfig, CircuitBreakerConfig, CircuitState, FetchOptions, RoadcastConfig,
};
use std::time::Duration;

/// Weather breaker opens after 3 failures and cools down for 1000ms.
fn weather_harness() -> Harness {
    let config = RoadcastConfig::default().with_categories(vec![
        CategoryConfig::new("weather")
            .with_pattern("open-meteo.com")
            .with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_failure_threshold(3)
                    .with_reset_timeout(Duration::from_millis(1000)),
            ),
        CategoryConfig::new("traffic").with_pattern("tomtom.com"),
    ]);
    harness(config)
}

async fn fail_three_times(h: &Harness) {
    h.transport.fail_times(3, Reply::server_error());
    for _ in 0..3 {
        let err = h
            .service
            .fetch(WEATHER_URL, FetchOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Upstream(_)));
    }
}

#[tokio::test(start_paused = true)]
async fn opens_fails_fast_then_recovers_through_a_single_trial() {
    let h = weather_harness();
    fail_three_times(&h).await;

    let breaker = h.service.breakers().get_or_create("weather");
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(
        breaker.next_attempt_at(),
        breaker.last_failure_at().map(|at| at + Duration::from_millis(1000))
    );

    // +500ms: still cooling down; the network is never touched.
    tokio::time::advance(Duration::from_millis(500)).await;
    let err = h
        .service
        .fetch(WEATHER_URL, FetchOptions::new())
        .await
        .unwrap_err();
    match &err {
        ApiError::CircuitOpen { category, status } => {
            assert_eq!(category, "weather");
            assert_eq!(status.state, CircuitState::Open);
            assert_eq!(status.next_attempt_in_ms, Some(500));
        }
        other => panic!("expected circuit open, got {other:?}"),
    }
    assert_eq!(err.retry_after(), Some(Duration::from_millis(500)));
    assert_eq!(h.transport.calls(), 3);

    // +1100ms: one trial goes through and closes the breaker.
    tokio::time::advance(Duration::from_millis(600)).await;
    h.service.fetch(WEATHER_URL, FetchOptions::new()).await.unwrap();
    assert_eq!(h.transport.calls(), 4);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(breaker.next_attempt_at(), None);

    let status = breaker.status();
    let transitions: Vec<_> = status
        .state_changes
        .iter()
        .map(|change| (change.from, change.to))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
    assert_eq!(status.total_requests, 4);
    assert_eq!(status.failed_requests, 3);
    assert_eq!(status.uptime_percentage, 25.0);
}

#[tokio::test(start_paused = true)]
async fn failed_trial_reopens_with_fresh_deadline() {
    let h = weather_harness();
    fail_three_times(&h).await;

    tokio::time::advance(Duration::from_millis(1000)).await;
    h.transport.push(Reply::server_error());
    let err = h
        .service
        .fetch(WEATHER_URL, FetchOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Upstream(_)));

    let breaker = h.service.breakers().get_or_create("weather");
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.status().next_attempt_in_ms, Some(1000));

    // The old deadline no longer applies.
    tokio::time::advance(Duration::from_millis(999)).await;
    assert!(matches!(
        h.service.fetch(WEATHER_URL, FetchOptions::new()).await,
        Err(ApiError::CircuitOpen { .. })
    ));
    assert_eq!(h.transport.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn half_open_admits_only_one_trial() {
    let h = weather_harness();
    fail_three_times(&h).await;
    tokio::time::advance(Duration::from_millis(1000)).await;

    h.transport.set_delay(Duration::from_millis(200));
    let trial = {
        let service = h.service.clone();
        tokio::spawn(async move {
            service
                .fetch(WEATHER_URL, FetchOptions::new())
                .await
        })
    };
    common::wait_until(|| h.transport.in_flight() == 1).await;

    let concurrent = h
        .service
        .fetch("https://api.open-meteo.com/v1/forecast?latitude=48.1", FetchOptions::new())
        .await;
    match concurrent {
        Err(ApiError::CircuitOpen { status, .. }) => {
            assert_eq!(status.state, CircuitState::HalfOpen)
        }
        other => panic!("expected circuit open, got {other:?}"),
    }

    trial.await.unwrap().unwrap();
    assert_eq!(h.transport.calls(), 4);
    assert_eq!(
        h.service.breakers().get_or_create("weather").state(),
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn categories_trip_independently() {
    let h = weather_harness();
    fail_three_times(&h).await;

    h.service.fetch(TRAFFIC_URL, FetchOptions::new()).await.unwrap();
    let health = h.service.health_status();
    assert_eq!(health.circuit_breakers["weather"].state, CircuitState::Open);
    assert_eq!(health.circuit_breakers["traffic"].state, CircuitState::Closed);
    assert!(!health.is_healthy());
}

#[tokio::test(start_paused = true)]
async fn success_in_between_resets_the_count() {
    let h = weather_harness();
    h.transport.fail_times(2, Reply::server_error());
    for _ in 0..2 {
        assert!(h.service.fetch(WEATHER_URL, FetchOptions::new()).await.is_err());
    }
    h.service
        .fetch(
            WEATHER_URL,
            FetchOptions::new().with_cache_ttl(Duration::from_millis(1)),
        )
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(1)).await;

    h.transport.fail_times(2, Reply::server_error());
    for _ in 0..2 {
        assert!(h.service.fetch(WEATHER_URL, FetchOptions::new()).await.is_err());
    }
    let breaker = h.service.breakers().get_or_create("weather");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn open_circuit_is_reported_to_metrics() {
    let h = weather_harness();
    fail_three_times(&h).await;
    let _ = h.service.fetch(WEATHER_URL, FetchOptions::new()).await;

    let last = h.metrics.events().pop().unwrap();
    assert_eq!(last.circuit_state, Some(CircuitState::Open));
    assert!(last.error.unwrap().contains("circuit breaker is open"));
}

#[tokio::test(start_paused = true)]
async fn unmatched_urls_share_the_default_breaker() {
    let h = weather_harness();
    h.service
        .fetch("https://example.com/cams.json", FetchOptions::new())
        .await
        .unwrap();
    assert!(h
        .service
        .health_status()
        .circuit_breakers
        .contains_key("default"));
}

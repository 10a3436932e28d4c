//! Tests for the running scheduler: dispatch, manual polls, backoff and
//! graceful shutdown.
//!
//! These use real time with a one-second tick, so every wait is bounded by
//! a timeout rather than a fixed sleep.

use std::future::Future;
use std::time::{Duration, Instant};

use forager::config::{FetcherConfig, SchedulerConfig};
use forager::feed::Fetcher;
use forager::scheduler::{run_poll, Scheduler};
use forager::storage::{ArticleQuery, Database, NewSource};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Mock</title>
    <item><guid>a</guid><title>First</title><link>https://example.com/a</link></item>
    <item><guid>b</guid><title>Second</title><link>https://example.com/b</link></item>
</channel></rss>"#;

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn test_fetcher() -> Fetcher {
    Fetcher::new(&FetcherConfig {
        retry_base_delay_ms: 1,
        ..Default::default()
    })
    .unwrap()
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_secs: 1,
        shutdown_grace_secs: 1,
        ..Default::default()
    }
}

async fn add_source(db: &Database, url: String, enabled: bool) -> i64 {
    db.insert_source(&NewSource {
        url,
        name: "Mock".to_string(),
        enabled,
        ..Default::default()
    })
    .await
    .unwrap()
}

async fn mount_feed(server: &MockServer, route: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
        .mount(server)
        .await;
}

/// Poll `check` until it returns true or `limit` elapses.
async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn request_count(server: &MockServer, route: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == route)
        .count()
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_new_source_is_polled_on_first_tick() {
    let server = MockServer::start().await;
    mount_feed(&server, "/feed").await;

    let db = test_db().await;
    add_source(&db, format!("{}/feed", server.uri()), true).await;

    let handle = Scheduler::new(db.clone(), test_fetcher(), fast_config(), 3600).spawn();

    let ingested = wait_until(Duration::from_secs(10), || {
        let db = db.clone();
        async move { db.count_articles(&ArticleQuery::default()).await.unwrap() == 2 }
    })
    .await;
    handle.shutdown().await;

    assert!(ingested, "articles never appeared");
}

#[tokio::test]
async fn test_disabled_source_is_never_polled() {
    let server = MockServer::start().await;
    mount_feed(&server, "/on").await;
    Mock::given(method("GET"))
        .and(path("/off"))
        .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
        .expect(0)
        .mount(&server)
        .await;

    let db = test_db().await;
    let on = add_source(&db, format!("{}/on", server.uri()), true).await;
    let off = add_source(&db, format!("{}/off", server.uri()), false).await;

    let handle = Scheduler::new(db.clone(), test_fetcher(), fast_config(), 3600).spawn();

    let polled = wait_until(Duration::from_secs(10), || {
        let db = db.clone();
        async move {
            db.get_source(on)
                .await
                .unwrap()
                .and_then(|s| s.last_polled_at)
                .is_some()
        }
    })
    .await;
    // A couple more ticks for the disabled source to (not) be picked up
    tokio::time::sleep(Duration::from_millis(2100)).await;
    handle.shutdown().await;

    assert!(polled);
    let off = db.get_source(off).await.unwrap().unwrap();
    assert_eq!(off.last_polled_at, None);
    assert_eq!(request_count(&server, "/off").await, 0);
}

#[tokio::test]
async fn test_recently_polled_source_waits_for_interval() {
    let server = MockServer::start().await;
    mount_feed(&server, "/feed").await;

    let db = test_db().await;
    let id = add_source(&db, format!("{}/feed", server.uri()), true).await;
    let source = db.get_source(id).await.unwrap().unwrap();
    assert!(run_poll(&db, &test_fetcher(), &source).await.is_success());

    let handle = Scheduler::new(db.clone(), test_fetcher(), fast_config(), 3600).spawn();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    handle.shutdown().await;

    assert_eq!(request_count(&server, "/feed").await, 1);
}

#[tokio::test]
async fn test_in_flight_polls_never_exceed_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(VALID_RSS)
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let db = test_db().await;
    for n in 0..5 {
        add_source(&db, format!("{}/s{}", server.uri(), n), true).await;
    }

    let config = SchedulerConfig {
        max_concurrent_polls: 2,
        ..fast_config()
    };
    let handle = Scheduler::new(db.clone(), test_fetcher(), config, 3600).spawn();

    let server = &server;
    let total = move || async move { server.received_requests().await.unwrap_or_default().len() };
    let started = wait_until(Duration::from_secs(10), move || async move { total().await >= 2 }).await;
    assert!(started, "polls never started");

    // Well inside the response delay: the first pair is still in flight
    tokio::time::sleep(Duration::from_millis(700)).await;
    let in_flight = total().await;

    let finished = wait_until(Duration::from_secs(20), move || async move { total().await >= 5 }).await;
    handle.shutdown().await;

    assert_eq!(in_flight, 2);
    assert!(finished, "remaining sources were never polled");
}

// ============================================================================
// Manual polls
// ============================================================================

#[tokio::test]
async fn test_poll_now_bypasses_interval() {
    let server = MockServer::start().await;
    mount_feed(&server, "/feed").await;

    let db = test_db().await;
    let id = add_source(&db, format!("{}/feed", server.uri()), true).await;
    let source = db.get_source(id).await.unwrap().unwrap();
    run_poll(&db, &test_fetcher(), &source).await;

    let handle = Scheduler::new(db.clone(), test_fetcher(), fast_config(), 3600).spawn();
    assert!(handle.poll_now(id).await);

    let server = &server;
    let repolled = wait_until(Duration::from_secs(10), move || async move {
        request_count(server, "/feed").await >= 2
    })
    .await;
    handle.shutdown().await;

    assert!(repolled, "poll_now did not trigger a fetch");
}

#[tokio::test]
async fn test_source_added_while_running_is_picked_up() {
    let server = MockServer::start().await;
    mount_feed(&server, "/late").await;

    let db = test_db().await;
    let handle = Scheduler::new(db.clone(), test_fetcher(), fast_config(), 3600).spawn();

    let id = add_source(&db, format!("{}/late", server.uri()), true).await;
    assert!(handle.reload().await);

    let polled = wait_until(Duration::from_secs(10), || {
        let db = db.clone();
        async move {
            db.get_source(id)
                .await
                .unwrap()
                .and_then(|s| s.last_polled_at)
                .is_some()
        }
    })
    .await;
    handle.shutdown().await;

    assert!(polled);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_failing_source_backs_off_instead_of_polling_every_tick() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let db = test_db().await;
    let id = add_source(&db, format!("{}/gone", server.uri()), true).await;

    let handle = Scheduler::new(db.clone(), test_fetcher(), fast_config(), 3600).spawn();
    let failed = wait_until(Duration::from_secs(10), || {
        let db = db.clone();
        async move { db.get_source(id).await.unwrap().unwrap().consecutive_failures == 1 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(2500)).await;
    handle.shutdown().await;

    assert!(failed);
    // 404 is not retried, and the backoff delay is far longer than the test
    assert_eq!(request_count(&server, "/gone").await, 1);
    let source = db.get_source(id).await.unwrap().unwrap();
    assert_eq!(source.consecutive_failures, 1);
    assert!(source.last_error.unwrap().contains("404"));
}

#[tokio::test]
async fn test_one_failing_source_does_not_block_others() {
    let server = MockServer::start().await;
    mount_feed(&server, "/good").await;
    Mock::given(method("GET"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not a feed</html>"))
        .mount(&server)
        .await;

    let db = test_db().await;
    let bad = add_source(&db, format!("{}/bad", server.uri()), true).await;
    let good = add_source(&db, format!("{}/good", server.uri()), true).await;

    let handle = Scheduler::new(db.clone(), test_fetcher(), fast_config(), 3600).spawn();
    let done = wait_until(Duration::from_secs(10), || {
        let db = db.clone();
        async move {
            let bad = db.get_source(bad).await.unwrap().unwrap();
            let good = db.get_source(good).await.unwrap().unwrap();
            bad.consecutive_failures == 1 && good.last_polled_at.is_some()
        }
    })
    .await;
    handle.shutdown().await;

    assert!(done);
    let query = ArticleQuery {
        source_id: Some(good),
        ..Default::default()
    };
    assert_eq!(db.count_articles(&query).await.unwrap(), 2);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_aborts_slow_poll_after_grace_period() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(VALID_RSS)
                .set_delay(Duration::from_secs(20)),
        )
        .mount(&server)
        .await;

    let db = test_db().await;
    let id = add_source(&db, format!("{}/slow", server.uri()), true).await;

    let handle = Scheduler::new(db.clone(), test_fetcher(), fast_config(), 3600).spawn();
    let server = &server;
    let started = wait_until(Duration::from_secs(10), move || async move {
        request_count(server, "/slow").await >= 1
    })
    .await;
    assert!(started, "slow poll never started");

    let begin = Instant::now();
    handle.shutdown().await;
    let elapsed = begin.elapsed();

    assert!(elapsed < Duration::from_secs(5), "shutdown took {:?}", elapsed);
    let source = db.get_source(id).await.unwrap().unwrap();
    assert_eq!(source.last_polled_at, None);
    assert_eq!(db.count_articles(&ArticleQuery::default()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_shutdown_when_idle_is_prompt() {
    let db = test_db().await;
    let handle = Scheduler::new(db, test_fetcher(), fast_config(), 3600).spawn();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let begin = Instant::now();
    handle.shutdown().await;
    assert!(begin.elapsed() < Duration::from_secs(1));
}

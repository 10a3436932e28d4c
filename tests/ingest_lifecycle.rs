//! End-to-end ingestion tests: HTTP (mocked) → parse → reconcile → store.
//!
//! Each test creates its own in-memory SQLite database and mock server.

use chrono::DateTime;
use forager::config::{FetcherConfig, SchedulerConfig};
use forager::feed::Fetcher;
use forager::reconcile::BatchStats;
use forager::scheduler::{run_poll, PollError, PollOutcome, Scheduler};
use forager::storage::{ArticleQuery, Database, NewSource, Source};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BASE_TS: i64 = 1_704_067_200; // 2024-01-01T00:00:00Z

struct Item {
    guid: Option<String>,
    title: Option<String>,
    link: Option<String>,
    published: Option<i64>,
}

fn item(n: usize) -> Item {
    Item {
        guid: Some(format!("item-{}", n)),
        title: Some(format!("Item {}", n)),
        link: Some(format!("https://example.com/items/{}", n)),
        published: Some(BASE_TS + n as i64 * 60),
    }
}

fn rss(items: &[Item]) -> String {
    let mut body = String::new();
    for it in items {
        body.push_str("<item>");
        if let Some(guid) = &it.guid {
            body.push_str(&format!("<guid>{}</guid>", guid));
        }
        if let Some(title) = &it.title {
            body.push_str(&format!("<title>{}</title>", title));
        }
        if let Some(link) = &it.link {
            body.push_str(&format!("<link>{}</link>", link));
        }
        if let Some(ts) = it.published {
            let date = DateTime::from_timestamp(ts, 0).unwrap().to_rfc2822();
            body.push_str(&format!("<pubDate>{}</pubDate>", date));
        }
        body.push_str("<description>Body text</description></item>");
    }
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Mock</title>{}</channel></rss>"#,
        body
    )
}

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

async fn add_source(db: &Database, url: &str) -> Source {
    let id = db
        .insert_source(&NewSource {
            url: url.to_string(),
            name: "Mock".to_string(),
            enabled: true,
            ..Default::default()
        })
        .await
        .unwrap();
    db.get_source(id).await.unwrap().unwrap()
}

async fn serve(server: &MockServer, route: &str, body: String) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

fn ingested(outcome: &Result<PollOutcome, PollError>) -> BatchStats {
    match outcome {
        Ok(PollOutcome::Ingested(stats)) => *stats,
        other => panic!("Expected Ingested, got {:?}", other),
    }
}

// ============================================================================
// Re-ingestion
// ============================================================================

#[tokio::test]
async fn test_repoll_identical_content_changes_nothing() {
    let server = MockServer::start().await;
    let db = test_db().await;
    let fetcher = test_fetcher();
    let source = add_source(&db, &format!("{}/feed", server.uri())).await;

    let items: Vec<Item> = (0..5).map(item).collect();
    serve(&server, "/feed", rss(&items)).await;

    let first = run_poll(&db, &fetcher, &source).await;
    assert_eq!(ingested(&first.outcome).inserted, 5);

    let second = run_poll(&db, &fetcher, &source).await;
    let stats = ingested(&second.outcome);
    assert_eq!(stats.inserted, 0);
    assert_eq!(stats.updated, 0);
    assert_eq!(stats.unchanged, 5);
}

#[tokio::test]
async fn test_one_new_guid_is_one_insert() {
    let server = MockServer::start().await;
    let db = test_db().await;
    let fetcher = test_fetcher();
    let source = add_source(&db, &format!("{}/feed", server.uri())).await;

    serve(&server, "/feed", rss(&(0..3).map(item).collect::<Vec<_>>())).await;
    run_poll(&db, &fetcher, &source).await;

    serve(&server, "/feed", rss(&(0..4).map(item).collect::<Vec<_>>())).await;
    let report = run_poll(&db, &fetcher, &source).await;
    let stats = ingested(&report.outcome);
    assert_eq!(stats.inserted, 1);
    assert_eq!(stats.updated, 0);
    assert_eq!(db.count_articles(&ArticleQuery::default()).await.unwrap(), 4);
}

#[tokio::test]
async fn test_labels_survive_repoll_with_changed_content() {
    let server = MockServer::start().await;
    let db = test_db().await;
    let fetcher = test_fetcher();
    let source = add_source(&db, &format!("{}/feed", server.uri())).await;

    serve(&server, "/feed", rss(&[item(1)])).await;
    run_poll(&db, &fetcher, &source).await;

    let article = db.list_articles(&ArticleQuery::default()).await.unwrap()[0].clone();
    db.merge_labels(article.id, &json!({"read": true}))
        .await
        .unwrap();

    let mut edited = item(1);
    edited.title = Some("Item 1 (corrected)".to_string());
    serve(&server, "/feed", rss(&[edited])).await;
    let report = run_poll(&db, &fetcher, &source).await;
    assert_eq!(ingested(&report.outcome).updated, 1);

    let after = db.get_article(article.id).await.unwrap().unwrap();
    assert_eq!(after.title, "Item 1 (corrected)");
    assert_eq!(after.labels.get("read"), Some(&json!(true)));
    assert_eq!(after.ingested_at, article.ingested_at);
    assert_eq!(after.identity_key, article.identity_key);
}

#[tokio::test]
async fn test_corrected_publication_date_keeps_identity() {
    let server = MockServer::start().await;
    let db = test_db().await;
    let fetcher = test_fetcher();
    let source = add_source(&db, &format!("{}/feed", server.uri())).await;

    let mut original = item(1);
    original.guid = None;
    serve(&server, "/feed", rss(&[original])).await;
    run_poll(&db, &fetcher, &source).await;

    let mut corrected = item(1);
    corrected.guid = None;
    corrected.published = Some(BASE_TS + 86_400);
    serve(&server, "/feed", rss(&[corrected])).await;
    let report = run_poll(&db, &fetcher, &source).await;
    assert_eq!(ingested(&report.outcome).updated, 1);

    let articles = db.list_articles(&ArticleQuery::default()).await.unwrap();
    assert_eq!(articles.len(), 1);
    assert_eq!(articles[0].published_at, BASE_TS + 86_400);
}

// ============================================================================
// Malformed input
// ============================================================================

#[tokio::test]
async fn test_item_without_title_or_link_is_skipped() {
    let server = MockServer::start().await;
    let db = test_db().await;
    let fetcher = test_fetcher();
    let source = add_source(&db, &format!("{}/feed", server.uri())).await;

    let bad = Item {
        guid: Some("bad".to_string()),
        title: None,
        link: None,
        published: None,
    };
    serve(&server, "/feed", rss(&[item(1), bad])).await;

    let report = run_poll(&db, &fetcher, &source).await;
    let stats = ingested(&report.outcome);
    assert_eq!(stats.inserted, 1);
    assert_eq!(stats.skipped_malformed, 1);
    assert_eq!(db.count_articles(&ArticleQuery::default()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_missing_date_falls_back_to_ingestion_time() {
    let server = MockServer::start().await;
    let db = test_db().await;
    let fetcher = test_fetcher();
    let source = add_source(&db, &format!("{}/feed", server.uri())).await;

    let mut undated = item(1);
    undated.published = None;
    serve(&server, "/feed", rss(&[undated])).await;
    run_poll(&db, &fetcher, &source).await;

    let article = &db.list_articles(&ArticleQuery::default()).await.unwrap()[0];
    assert_eq!(article.published_at, article.ingested_at);
}

// ============================================================================
// Identity scope
// ============================================================================

#[tokio::test]
async fn test_same_guid_in_two_sources_coexists() {
    let server = MockServer::start().await;
    let db = test_db().await;
    let fetcher = test_fetcher();
    let a = add_source(&db, &format!("{}/a", server.uri())).await;
    let b = add_source(&db, &format!("{}/b", server.uri())).await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[item(1)])))
        .mount(&server)
        .await;

    run_poll(&db, &fetcher, &a).await;
    run_poll(&db, &fetcher, &b).await;

    let articles = db.list_articles(&ArticleQuery::default()).await.unwrap();
    assert_eq!(articles.len(), 2);
    assert_eq!(articles[0].identity_key, articles[1].identity_key);
    assert_ne!(articles[0].source_id, articles[1].source_id);
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn test_pagination_window_over_250_articles() {
    let server = MockServer::start().await;
    let db = test_db().await;
    let fetcher = test_fetcher();
    let source = add_source(&db, &format!("{}/feed", server.uri())).await;

    serve(&server, "/feed", rss(&(0..250).map(item).collect::<Vec<_>>())).await;
    let report = run_poll(&db, &fetcher, &source).await;
    assert_eq!(ingested(&report.outcome).inserted, 250);

    let query = ArticleQuery {
        source_id: Some(source.id),
        skip: 100,
        limit: Some(50),
        ..Default::default()
    };
    let page = db.list_articles(&query).await.unwrap();
    assert_eq!(page.len(), 50);

    // Newest is item 249, so the 101st..150th newest are items 149 down to 100
    let titles: Vec<String> = page.iter().map(|a| a.title.clone()).collect();
    let expected: Vec<String> = (100..150).rev().map(|n| format!("Item {}", n)).collect();
    assert_eq!(titles, expected);
    assert_eq!(db.count_articles(&query).await.unwrap(), 250);
}

#[tokio::test]
async fn test_publication_window_filters_list_and_count() {
    let server = MockServer::start().await;
    let db = test_db().await;
    let fetcher = test_fetcher();
    let source = add_source(&db, &format!("{}/feed", server.uri())).await;

    serve(&server, "/feed", rss(&(0..10).map(item).collect::<Vec<_>>())).await;
    run_poll(&db, &fetcher, &source).await;

    // Items 3, 4, 5 and 6: after is inclusive, before is exclusive
    let window = ArticleQuery {
        published_after: Some(BASE_TS + 3 * 60),
        published_before: Some(BASE_TS + 7 * 60),
        ..Default::default()
    };
    let titles: Vec<String> = db
        .list_articles(&window)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.title)
        .collect();
    assert_eq!(titles, vec!["Item 6", "Item 5", "Item 4", "Item 3"]);
    assert_eq!(db.count_articles(&window).await.unwrap(), 4);

    let older = ArticleQuery {
        published_before: Some(BASE_TS + 2 * 60),
        ..Default::default()
    };
    assert_eq!(db.count_articles(&older).await.unwrap(), 2);
}

#[tokio::test]
async fn test_purge_removes_only_older_articles() {
    let server = MockServer::start().await;
    let db = test_db().await;
    let fetcher = test_fetcher();
    let source = add_source(&db, &format!("{}/feed", server.uri())).await;

    serve(&server, "/feed", rss(&(0..10).map(item).collect::<Vec<_>>())).await;
    run_poll(&db, &fetcher, &source).await;

    let purged = db.purge_articles(source.id, BASE_TS + 5 * 60).await.unwrap();
    assert_eq!(purged, 5);

    let remaining = db.list_articles(&ArticleQuery::default()).await.unwrap();
    assert_eq!(remaining.len(), 5);
    assert!(remaining.iter().all(|a| a.published_at >= BASE_TS + 5 * 60));

    // Purged items still in the feed come back as new on the next poll
    let report = run_poll(&db, &fetcher, &source).await;
    let stats = ingested(&report.outcome);
    assert_eq!(stats.inserted, 5);
    assert_eq!(stats.unchanged, 5);
}

// ============================================================================
// One-shot sweep
// ============================================================================

#[tokio::test]
async fn test_run_once_polls_enabled_sources_only() {
    let server = MockServer::start().await;
    let db = test_db().await;

    Mock::given(method("GET"))
        .and(path("/on"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[item(1)])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/off"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&[item(2)])))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    add_source(&db, &format!("{}/on", server.uri())).await;
    let off = add_source(&db, &format!("{}/off", server.uri())).await;
    db.set_source_enabled(off.id, false).await.unwrap();
    let broken = add_source(&db, &format!("{}/broken", server.uri())).await;

    let scheduler = Scheduler::new(db.clone(), test_fetcher(), SchedulerConfig::default(), 3600);
    let reports = scheduler.run_once().await.unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(reports.iter().filter(|r| r.is_success()).count(), 1);
    let failed = db.get_source(broken.id).await.unwrap().unwrap();
    assert_eq!(failed.consecutive_failures, 1);
    assert!(failed.last_error.is_some());
}

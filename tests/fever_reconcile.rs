//! End-to-end Fever mirroring: groups/feeds/items ingestion, full-set status
//! reconciliation, since_id advancement, and auth failure aborting a pass.

use pretty_assertions::assert_eq;
use secrecy::SecretString;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use quill::storage::Database;
use quill::sync::{FeverClient, FeverStrategy, ReaderStrategy, RefreshReason, SyncError};
use quill::util::derive_id;

/// Dispatches Fever API commands off the query string the way the protocol's
/// single endpoint does. Items 1, 2, 3 exist; 2 is unread, 3 is saved.
fn fever_responder(req: &Request) -> ResponseTemplate {
    let query = req.url.query().unwrap_or("");
    let body = if query.contains("unread_item_ids") {
        r#"{"api_version":3,"auth":1,"unread_item_ids":"2"}"#.to_string()
    } else if query.contains("saved_item_ids") {
        r#"{"api_version":3,"auth":1,"saved_item_ids":"3"}"#.to_string()
    } else if query.contains("groups") {
        r#"{"api_version":3,"auth":1,
            "groups":[{"id":1,"title":"News"}],
            "feeds_groups":[{"group_id":1,"feed_ids":"10"}]}"#
            .to_string()
    } else if query.contains("feeds") {
        r#"{"api_version":3,"auth":1,
            "feeds":[{"id":10,"title":"Example","url":"https://example.com/feed","site_url":"https://example.com"}],
            "feeds_groups":[{"group_id":1,"feed_ids":"10"}]}"#
            .to_string()
    } else if query.contains("items") {
        let since: i64 = query
            .split('&')
            .find_map(|p| p.strip_prefix("since_id="))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if since >= 3 {
            r#"{"api_version":3,"auth":1,"items":[]}"#.to_string()
        } else {
            r#"{"api_version":3,"auth":1,"items":[
                {"id":1,"feed_id":10,"title":"One","html":"<p>one</p>","url":"https://example.com/1","is_read":1,"is_saved":0,"created_on_time":1700000000},
                {"id":2,"feed_id":10,"title":"Two","html":"<p>two</p>","url":"https://example.com/2","is_read":0,"is_saved":0,"created_on_time":1700000100},
                {"id":3,"feed_id":10,"title":"Three","html":"<p>three</p>","url":"https://example.com/3","is_read":1,"is_saved":1,"created_on_time":1700000200}
            ]}"#
            .to_string()
        }
    } else {
        r#"{"api_version":3,"auth":1}"#.to_string()
    };
    ResponseTemplate::new(200)
        .set_body_string(body)
        .insert_header("content-type", "application/json")
}

fn strategy_for(server: &MockServer, db: Database) -> FeverStrategy {
    let client = FeverClient::new(
        reqwest::Client::new(),
        format!("{}/fever/", server.uri()),
        SecretString::from("d41d8cd98f00b204e9800998ecf8427e"),
    );
    FeverStrategy::new(client, db)
}

fn item_id(remote: i64) -> String {
    derive_id(&remote.to_string())
}

#[tokio::test]
async fn refresh_mirrors_and_reconciles() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(fever_responder)
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let strategy = strategy_for(&server, db.clone());

    let summary = strategy.refresh(None, RefreshReason::Manual).await.unwrap();
    assert_eq!(summary.feeds_used, 1);
    assert_eq!(summary.new_articles, 3);

    // Group became a folder, feed joined it
    let folders = db.list_folders().await.unwrap();
    assert_eq!(folders.len(), 1);
    assert_eq!(folders[0].title, "News");

    let feeds = db.list_feeds().await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].id, derive_id("https://example.com/feed"));
    assert_eq!(feeds[0].folder_id, Some(folders[0].id));

    // Reconciliation truth table: 2 unread, 3 saved, everything else
    // read and unsaved
    let one = db.get_article(&item_id(1)).await.unwrap().unwrap();
    assert!(one.read && !one.saved);
    assert_eq!(one.remote_id, Some(1));

    let two = db.get_article(&item_id(2)).await.unwrap().unwrap();
    assert!(!two.read && !two.saved);

    let three = db.get_article(&item_id(3)).await.unwrap().unwrap();
    assert!(three.read && three.saved);
}

#[tokio::test]
async fn second_refresh_resumes_from_since_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(fever_responder)
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let strategy = strategy_for(&server, db.clone());

    strategy.refresh(None, RefreshReason::Manual).await.unwrap();
    assert_eq!(db.get_marker("fever.since_id").await.unwrap().as_deref(), Some("3"));

    // The responder returns no items past id 3, so nothing new arrives
    let again = strategy.refresh(None, RefreshReason::Manual).await.unwrap();
    assert_eq!(again.new_articles, 0);
}

#[tokio::test]
async fn remote_status_change_overrides_local() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(fever_responder)
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let strategy = strategy_for(&server, db.clone());
    strategy.refresh(None, RefreshReason::Manual).await.unwrap();

    // Diverge locally: save item 1, unread item 3
    db.set_saved(&item_id(1), true).await.unwrap();
    db.set_read(&item_id(3), false).await.unwrap();

    // The remote's sets still say only 2 is unread and only 3 is saved
    strategy.refresh(None, RefreshReason::Manual).await.unwrap();

    let one = db.get_article(&item_id(1)).await.unwrap().unwrap();
    assert!(!one.saved, "remote un-save wins over the local flag");
    let three = db.get_article(&item_id(3)).await.unwrap().unwrap();
    assert!(three.read, "remote read state wins over the local flag");
}

#[tokio::test]
async fn auth_failure_aborts_before_writing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"api_version":3,"auth":0}"#)
                .insert_header("content-type", "application/json"),
        )
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let strategy = strategy_for(&server, db.clone());

    match strategy.refresh(None, RefreshReason::Manual).await {
        Err(SyncError::Auth) => {}
        other => panic!("Expected Auth error, got {:?}", other.map(|_| ())),
    }

    assert!(db.list_feeds().await.unwrap().is_empty());
    assert!(db.list_folders().await.unwrap().is_empty());
    assert!(db.get_marker("fever.since_id").await.unwrap().is_none());
}

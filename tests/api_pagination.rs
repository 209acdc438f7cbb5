//! Pagination engine termination rules against a mock GraphQL endpoint:
//! empty-page stop, limit semantics, per-stream dedup, single-shot
//! content-not-found.

use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use mockito::Matcher;
use serde_json::json;

use tws::{gather, AccountExtras, AccountsPool, Api};

const SEARCH_PATH: &str = "/L1VfBERtzc3VkBBT0YAYHA/SearchTimeline";

fn temp_db(name: &str) -> String {
    let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    std::env::temp_dir()
        .join(format!("tws_api_{name}_{ts}.db"))
        .to_string_lossy()
        .into_owned()
}

async fn one_account_pool(name: &str) -> AccountsPool {
    let pool = AccountsPool::new(temp_db(name));
    pool.add_account("user1", "pass1", "email1", "email_pass1", AccountExtras::default())
        .await
        .unwrap();
    pool.set_active("user1", true).await.unwrap();
    pool
}

fn page(entry_ids: &[&str], cursor: Option<&str>) -> String {
    let mut entries: Vec<serde_json::Value> = entry_ids
        .iter()
        .map(|id| json!({ "entryId": id, "content": {} }))
        .collect();
    if let Some(cur) = cursor {
        entries.push(json!({
            "entryId": format!("cursor-bottom-{cur}"),
            "content": { "cursorType": "Bottom", "value": cur }
        }));
    }
    json!({ "data": { "timeline": { "entries": entries } } }).to_string()
}

#[tokio::test]
async fn stops_on_first_empty_page() {
    let pool = one_account_pool("empty").await;
    let mut server = mockito::Server::new_async().await;

    // LIFO matching: the cursor-bound page is registered last so it wins
    // when the cursor shows up in the query
    let m1 = server
        .mock("GET", SEARCH_PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(page(&["tweet-1", "tweet-2"], Some("c1")))
        .expect(1)
        .create_async()
        .await;
    let m2 = server
        .mock("GET", SEARCH_PATH)
        .match_query(Matcher::Regex("c1".to_string()))
        .with_status(200)
        .with_body(page(&[], Some("c2")))
        .expect(1)
        .create_async()
        .await;

    let api = Api::new(pool).with_gql_url(server.url());
    let pages = gather(api.search("rust", -1)).await.unwrap();

    // page 1 is yielded, the empty page 2 is not, and no third request is made
    assert_eq!(pages.len(), 1);
    assert_eq!(
        pages[0].body["data"]["timeline"]["entries"][0]["entryId"],
        "tweet-1"
    );
    m1.assert_async().await;
    m2.assert_async().await;
}

#[tokio::test]
async fn stops_when_cursor_missing() {
    let pool = one_account_pool("nocursor").await;
    let mut server = mockito::Server::new_async().await;

    let m = server
        .mock("GET", SEARCH_PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(page(&["tweet-1"], None))
        .expect(1)
        .create_async()
        .await;

    let api = Api::new(pool).with_gql_url(server.url());
    let pages = gather(api.search("rust", -1)).await.unwrap();
    assert_eq!(pages.len(), 1);
    m.assert_async().await;
}

#[tokio::test]
async fn limit_zero_yields_nothing_after_one_probe() {
    let pool = one_account_pool("limit0").await;
    let mut server = mockito::Server::new_async().await;

    let m = server
        .mock("GET", SEARCH_PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(page(&["tweet-1"], Some("c1")))
        .expect(1)
        .create_async()
        .await;

    let api = Api::new(pool).with_gql_url(server.url());
    let pages = gather(api.search("rust", 0)).await.unwrap();
    assert!(pages.is_empty());
    m.assert_async().await;
}

#[tokio::test]
async fn limit_stops_after_enough_entries() {
    let pool = one_account_pool("limit").await;
    let mut server = mockito::Server::new_async().await;

    let m = server
        .mock("GET", SEARCH_PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(page(&["tweet-1", "tweet-2"], Some("c1")))
        .expect(1)
        .create_async()
        .await;

    let api = Api::new(pool).with_gql_url(server.url());
    // two entries satisfy limit=2; the cursor is not followed
    let pages = gather(api.search("rust", 2)).await.unwrap();
    assert_eq!(pages.len(), 1);
    m.assert_async().await;
}

#[tokio::test]
async fn repeated_entries_end_the_stream() {
    let pool = one_account_pool("dedup").await;
    let mut server = mockito::Server::new_async().await;

    let m1 = server
        .mock("GET", SEARCH_PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(page(&["tweet-1", "tweet-2"], Some("c1")))
        .expect(1)
        .create_async()
        .await;
    // the remote loops: same entries again under a new cursor
    let m2 = server
        .mock("GET", SEARCH_PATH)
        .match_query(Matcher::Regex("c1".to_string()))
        .with_status(200)
        .with_body(page(&["tweet-1", "tweet-2"], Some("c2")))
        .expect(1)
        .create_async()
        .await;

    let api = Api::new(pool).with_gql_url(server.url());
    let pages = gather(api.search("rust", -1)).await.unwrap();
    assert_eq!(pages.len(), 1);
    m1.assert_async().await;
    m2.assert_async().await;
}

#[tokio::test]
async fn early_stream_drop_releases_lease() {
    let pool = one_account_pool("earlydrop").await;
    let mut server = mockito::Server::new_async().await;

    server
        .mock("GET", SEARCH_PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(page(&["tweet-1"], Some("c1")))
        .create_async()
        .await;
    server
        .mock("GET", SEARCH_PATH)
        .match_query(Matcher::Regex("c1".to_string()))
        .with_status(200)
        .with_body(page(&["tweet-9"], Some("c2")))
        .create_async()
        .await;

    let api = Api::new(pool.clone()).with_gql_url(server.url());
    {
        let stream = api.search("rust", -1);
        futures::pin_mut!(stream);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.username, "user1");
        // caller breaks out here; the lease must not stay behind
    }

    for _ in 0..50 {
        let acc = pool.get("user1").await.unwrap();
        if !acc.locks.contains_key("SearchTimeline") {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("lease was not released after early stream drop");
}

#[tokio::test]
async fn single_shot_not_found_is_absent() {
    let pool = one_account_pool("notfound").await;
    let mut server = mockito::Server::new_async().await;

    server
        .mock("GET", "/NmCeCgkVlsRGS1cAwqtgmw/TweetDetail")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({ "errors": [{ "code": 144, "message": "_Missing: No status found with that ID." }] })
                .to_string(),
        )
        .create_async()
        .await;

    let api = Api::new(pool).with_gql_url(server.url());
    let rep = api.tweet_details(12345).await.unwrap();
    assert!(rep.is_none());
}

#[tokio::test]
async fn empty_pool_yields_empty_stream() {
    let pool = AccountsPool::new(temp_db("nopool"));
    // touch the db so the schema exists, but add no accounts
    assert!(pool.get_all().await.unwrap().is_empty());

    let api = Api::new(pool).with_gql_url("http://127.0.0.1:1");
    let pages = gather(api.search("rust", -1)).await.unwrap();
    assert!(pages.is_empty());
}

#[tokio::test]
async fn dependency_error_aborts_quietly() {
    let pool = one_account_pool("dep131").await;
    let mut server = mockito::Server::new_async().await;

    server
        .mock("GET", SEARCH_PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({ "errors": [{ "code": 131, "message": "Dependency: Internal error." }] })
                .to_string(),
        )
        .create_async()
        .await;

    let api = Api::new(pool.clone()).with_gql_url(server.url());
    // downstream sees an ended stream, never an error
    let pages = gather(api.search("rust", -1)).await.unwrap();
    assert!(pages.is_empty());
}

//! Request engine: single-shot lookups and the cursored pagination driver,
//! plus the typed wrappers over the operation catalogue.
//!
//! Paginated calls return lazy streams of raw response pages. Dropping a
//! stream early releases the underlying account lease; consuming it to the
//! end releases it on the spot.

use std::collections::HashSet;
use std::sync::Arc;

use async_stream::try_stream;
use futures::pin_mut;
use futures::Stream;
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::error::Result;
use crate::ops::{self, Op};
use crate::pool::AccountsPool;
use crate::queue_client::{ApiRep, QueueClient};
use crate::util::{encode_params, find_obj, get_by_path};
use crate::xclid::XClIdGen;

/// Cursor kind closing a page. Reply trees grow downward through
/// "ShowMoreThreads" instead of the usual bottom cursor.
const CURSOR_BOTTOM: &str = "Bottom";
const CURSOR_MORE_THREADS: &str = "ShowMoreThreads";

#[derive(Clone)]
pub struct Api {
    pool: AccountsPool,
    debug: bool,
    proxy: Option<String>,
    clid: Option<Arc<XClIdGen>>,
    gql_url: String,
}

impl Api {
    pub fn new(pool: AccountsPool) -> Self {
        Self {
            pool,
            debug: false,
            proxy: None,
            clid: None,
            gql_url: ops::GQL_URL.to_string(),
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Attach a challenge-token generator; every request then carries a
    /// fresh `x-client-transaction-id`.
    pub fn with_clid_gen(mut self, clid: Arc<XClIdGen>) -> Self {
        self.clid = Some(clid);
        self
    }

    /// Override the GraphQL endpoint (tests point this at a local server).
    pub fn with_gql_url(mut self, url: impl Into<String>) -> Self {
        self.gql_url = url.into();
        self
    }

    pub fn pool(&self) -> &AccountsPool {
        &self.pool
    }

    fn op_url(&self, op: Op) -> String {
        format!("{}/{}/{}", self.gql_url, op.id, op.name)
    }

    fn queue_client(&self, queue: &str) -> QueueClient {
        QueueClient::new(self.pool.clone(), queue)
            .with_debug(self.debug)
            .with_proxy(self.proxy.clone())
            .with_clid_gen(self.clid.clone())
    }

    /// One GET, one response. Content-not-found comes back as `None`, not
    /// an error.
    pub async fn gql_item(
        &self,
        op: Op,
        variables: Value,
        extra_features: Option<Value>,
    ) -> Result<Option<ApiRep>> {
        let features = merge_features(extra_features);
        let params = encode_params(&[("variables", variables), ("features", features)]);

        let mut client = self.queue_client(op.name);
        let rep = client.get(&self.op_url(op), &params).await?;
        client.close().await?;

        Ok(rep.filter(|r| !r.error_msg.contains("_Missing: No status found with that ID.")))
    }

    /// Cursored pagination. Yields raw pages; stops on the first page whose
    /// filtered entries are all empty or already seen, when the cursor runs
    /// out, or when `limit` entries have been yielded (`-1` = unbounded,
    /// `0` = probe only, yield nothing).
    pub fn gql_items(
        &self,
        op: Op,
        variables: Value,
        extra_features: Option<Value>,
        limit: i64,
    ) -> impl Stream<Item = Result<ApiRep>> {
        self.gql_items_cursor(op, variables, extra_features, limit, CURSOR_BOTTOM)
    }

    fn gql_items_cursor(
        &self,
        op: Op,
        variables: Value,
        extra_features: Option<Value>,
        limit: i64,
        cursor_type: &'static str,
    ) -> impl Stream<Item = Result<ApiRep>> {
        let mut client = self.queue_client(op.name);
        let url = self.op_url(op);

        try_stream! {
            let features = merge_features(extra_features);
            let mut cursor: Option<String> = None;
            let mut total = 0i64;
            let mut seen: HashSet<String> = HashSet::new();

            loop {
                let mut vars = variables.clone();
                if let Some(cur) = &cursor {
                    vars["cursor"] = json!(cur);
                }

                let mut query = vec![("variables", vars), ("features", features.clone())];
                if ops::FIELD_TOGGLE_QUEUES.contains(&op.name) {
                    query.push(("fieldToggles", ops::field_toggles()));
                }
                let params = encode_params(&query);

                let Some(rep) = client.get(&url, &params).await? else { break };

                let mut fresh = 0i64;
                if let Some(items) = get_by_path(&rep.body, "entries").and_then(Value::as_array) {
                    for entry in items {
                        let id = entry.get("entryId").and_then(Value::as_str).unwrap_or_default();
                        if id.starts_with("cursor-") || id.starts_with("messageprompt-") {
                            continue;
                        }
                        if seen.insert(id.to_string()) {
                            fresh += 1;
                        }
                    }
                }

                let next_cursor: Option<String> = find_obj(&rep.body, &|o| {
                    o.get("cursorType").and_then(Value::as_str) == Some(cursor_type)
                })
                .and_then(|o| o.get("value"))
                .and_then(Value::as_str)
                .map(str::to_string);

                if fresh == 0 || limit == 0 {
                    break;
                }

                total += fresh;
                yield rep;

                match next_cursor {
                    None => break,
                    Some(_) if limit > 0 && total >= limit => break,
                    Some(cur) => cursor = Some(cur),
                }
            }

            client.close().await?;
        }
    }

    // MARK: typed operations

    pub fn search(&self, query: &str, limit: i64) -> impl Stream<Item = Result<ApiRep>> {
        let vars = json!({
            "rawQuery": query,
            "count": 20,
            "querySource": "typed_query",
            "product": "Top",
        });
        self.gql_items(ops::SEARCH_TIMELINE, vars, None, limit)
    }

    pub async fn user_by_id(&self, uid: u64) -> Result<Option<ApiRep>> {
        let vars = json!({ "userId": uid.to_string(), "withSafetyModeUserFields": true });
        self.gql_item(ops::USER_BY_REST_ID, vars, Some(ops::user_extra_features())).await
    }

    pub async fn user_by_login(&self, login: &str) -> Result<Option<ApiRep>> {
        let vars = json!({ "screen_name": login, "withSafetyModeUserFields": true });
        self.gql_item(ops::USER_BY_SCREEN_NAME, vars, Some(ops::user_extra_features())).await
    }

    pub async fn tweet_details(&self, twid: u64) -> Result<Option<ApiRep>> {
        self.gql_item(ops::TWEET_DETAIL, tweet_detail_vars(twid), None).await
    }

    /// Reply tree of one tweet, paged through "ShowMoreThreads" cursors.
    pub fn tweet_replies(&self, twid: u64, limit: i64) -> impl Stream<Item = Result<ApiRep>> {
        self.gql_items_cursor(
            ops::TWEET_DETAIL,
            tweet_detail_vars(twid),
            None,
            limit,
            CURSOR_MORE_THREADS,
        )
    }

    pub fn retweeters(&self, twid: u64, limit: i64) -> impl Stream<Item = Result<ApiRep>> {
        let vars = json!({ "tweetId": twid.to_string(), "count": 20, "includePromotedContent": true });
        self.gql_items(ops::RETWEETERS, vars, None, limit)
    }

    pub fn favoriters(&self, twid: u64, limit: i64) -> impl Stream<Item = Result<ApiRep>> {
        let vars = json!({ "tweetId": twid.to_string(), "count": 20, "includePromotedContent": true });
        self.gql_items(ops::FAVORITERS, vars, None, limit)
    }

    pub fn followers(&self, uid: u64, limit: i64) -> impl Stream<Item = Result<ApiRep>> {
        let vars = json!({ "userId": uid.to_string(), "count": 20, "includePromotedContent": false });
        self.gql_items(ops::FOLLOWERS, vars, None, limit)
    }

    pub fn following(&self, uid: u64, limit: i64) -> impl Stream<Item = Result<ApiRep>> {
        let vars = json!({ "userId": uid.to_string(), "count": 20, "includePromotedContent": false });
        self.gql_items(ops::FOLLOWING, vars, None, limit)
    }

    pub fn user_tweets(&self, uid: u64, limit: i64) -> impl Stream<Item = Result<ApiRep>> {
        let vars = json!({
            "userId": uid.to_string(),
            "count": 40,
            "includePromotedContent": true,
            "withQuickPromoteEligibilityTweetFields": true,
            "withVoice": true,
            "withV2Timeline": true,
        });
        self.gql_items(ops::USER_TWEETS, vars, None, limit)
    }

    pub fn user_tweets_and_replies(&self, uid: u64, limit: i64) -> impl Stream<Item = Result<ApiRep>> {
        let vars = json!({
            "userId": uid.to_string(),
            "count": 40,
            "includePromotedContent": true,
            "withCommunity": true,
            "withVoice": true,
            "withV2Timeline": true,
        });
        self.gql_items(ops::USER_TWEETS_AND_REPLIES, vars, None, limit)
    }

    pub fn list_timeline(&self, list_id: u64, limit: i64) -> impl Stream<Item = Result<ApiRep>> {
        let vars = json!({ "listId": list_id.to_string(), "count": 20 });
        self.gql_items(ops::LIST_LATEST_TWEETS_TIMELINE, vars, None, limit)
    }
}

fn tweet_detail_vars(twid: u64) -> Value {
    json!({
        "focalTweetId": twid.to_string(),
        "with_rux_injections": false,
        "includePromotedContent": true,
        "withCommunity": true,
        "withQuickPromoteEligibilityTweetFields": true,
        "withBirdwatchNotes": true,
        "withVoice": true,
        "withV2Timeline": true,
    })
}

fn merge_features(extra: Option<Value>) -> Value {
    let mut features = ops::gql_features();
    if let (Some(base), Some(Value::Object(extra))) = (features.as_object_mut(), extra) {
        for (k, v) in extra {
            base.insert(k, v);
        }
    }
    features
}

/// Collects a whole stream. Convenience for callers that don't need lazy
/// consumption.
pub async fn gather<T>(stream: impl Stream<Item = Result<T>>) -> Result<Vec<T>> {
    pin_mut!(stream);
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_merge_prefers_extras() {
        let merged = merge_features(Some(json!({
            "verified_phone_label_enabled": true,
            "brand_new_flag": true,
        })));
        assert_eq!(merged["verified_phone_label_enabled"], json!(true));
        assert_eq!(merged["brand_new_flag"], json!(true));
        // untouched defaults survive
        assert_eq!(merged["vibe_api_enabled"], json!(true));

        let plain = merge_features(None);
        assert_eq!(plain["verified_phone_label_enabled"], json!(false));
    }
}

//! Scoped-lease HTTP wrapper.
//!
//! A [`QueueClient`] leases one account for one queue, funnels requests
//! through that account's client, and classifies every response. Rate
//! limits extend the lease to the reset time and switch accounts; bans
//! deactivate the account and switch; transient conditions release and
//! re-lease. Callers only ever see clean responses or fatal errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use serde_json::Value;

use crate::account::Account;
use crate::error::{Error, Result};
use crate::pool::AccountsPool;
use crate::util::{get_or, utc_now, utc_ts};
use crate::xclid::XClIdGen;

const UNKNOWN_RETRIES: u32 = 3;
const CONNECT_RETRIES: u32 = 3;
const PENALTY_SECS: i64 = 15 * 60;

/// A classified, JSON-decoded response annotated with the account that
/// produced it.
#[derive(Clone, Debug)]
pub struct ApiRep {
    pub username: String,
    pub url: String,
    pub status: u16,
    pub limit_remaining: i64,
    pub limit_reset: i64,
    pub body: Value,
    pub error_msg: String,
}

impl ApiRep {
    async fn read(resp: reqwest::Response, username: String) -> Result<Self> {
        let status = resp.status().as_u16();
        let url = resp.url().to_string();
        let limit_remaining = header_int(&resp, "x-rate-limit-remaining");
        let limit_reset = header_int(&resp, "x-rate-limit-reset");

        let text = resp.text().await?;
        let body: Value = serde_json::from_str(&text)
            .unwrap_or_else(|_| serde_json::json!({ "_raw": text }));
        let error_msg = body_error_text(&body);

        Ok(Self { username, url, status, limit_remaining, limit_reset, body, error_msg })
    }

    /// `remaining/reset - username`, the per-request log tag.
    pub fn request_id(&self) -> String {
        format!("{}/{} - {}", self.limit_remaining, self.limit_reset, self.username)
    }

    pub fn json(&self) -> &Value {
        &self.body
    }
}

fn header_int(resp: &reqwest::Response, name: &str) -> i64 {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(-1)
}

/// Joined, de-duplicated `"(code) message"` rendering of the body's
/// `errors` array; `"OK"` when there are none.
pub(crate) fn body_error_text(body: &Value) -> String {
    let Some(errors) = body.get("errors").and_then(Value::as_array) else {
        return "OK".to_string();
    };

    let msgs: std::collections::BTreeSet<String> = errors
        .iter()
        .map(|e| {
            let code = e.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let msg = e.get("message").and_then(Value::as_str).unwrap_or("");
            format!("({code}) {msg}")
        })
        .collect();

    if msgs.is_empty() {
        "OK".to_string()
    } else {
        msgs.into_iter().collect::<Vec<_>>().join("; ")
    }
}

/// Classification of one response. Exactly one verdict per response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Pass the response to the caller.
    Ok,
    /// Pass through, but log the oddity.
    OkWarn(String),
    /// Lease the account until the given unix timestamp, continue elsewhere.
    RateLimited(i64),
    /// Deactivate the account, continue elsewhere.
    Banned(Option<String>),
    /// Release the lease and retry on another account (stale cursor etc).
    Retry(String),
    /// Abandon the whole logical operation.
    Abort,
    /// Operator action required (feature-flag table out of date).
    Fatal(String),
    /// Unrecognized failure; bounded retries then penalty.
    Unknown(String),
}

pub(crate) fn check_rep(rep: &ApiRep) -> Verdict {
    let err = rep.error_msg.as_str();

    if err.contains("The following features cannot be null") {
        return Verdict::Fatal(err.to_string());
    }

    if rep.limit_remaining == 0 && rep.limit_reset > 0 {
        return Verdict::RateLimited(rep.limit_reset);
    }

    if err.starts_with("(88) Rate limit exceeded") || rep.status == 429 {
        return Verdict::RateLimited(utc_ts() + 4 * 3600);
    }

    if err.starts_with("(326) Authorization: Denied by access control")
        || err.starts_with("(64) Your account is suspended")
        || err.starts_with("(32) Could not authenticate you")
    {
        return Verdict::Banned(Some(err.to_string()));
    }

    if err.starts_with("(29) Timeout: Unspecified") {
        return Verdict::Retry(err.to_string());
    }

    if err == "OK" && matches!(rep.status, 401 | 403) {
        // no body error but the session is gone
        return Verdict::Banned(None);
    }

    if err.starts_with("(131) Dependency: Internal error") {
        if rep.status == 200 && get_or(&rep.body, "data.user").is_some() {
            return Verdict::Ok;
        }
        return Verdict::Abort;
    }

    if rep.status == 200 && err.contains("_Missing: No status found with that ID.") {
        // content gone, not an account problem
        return Verdict::Ok;
    }

    if rep.status == 200 && err != "OK" {
        // includes the tolerated "Authorization" quirk; content still usable
        return Verdict::OkWarn(err.to_string());
    }

    if rep.status == 200 {
        return Verdict::Ok;
    }

    Verdict::Unknown(format!("HTTP {} - {err}", rep.status))
}

struct Ctx {
    account: Account,
    client: reqwest::Client,
    req_count: i64,
}

pub struct QueueClient {
    pool: AccountsPool,
    queue: String,
    debug: bool,
    proxy: Option<String>,
    clid: Option<Arc<XClIdGen>>,
    ctx: Option<Ctx>,
}

impl QueueClient {
    pub fn new(pool: AccountsPool, queue: impl Into<String>) -> Self {
        Self {
            pool,
            queue: queue.into(),
            debug: false,
            proxy: None,
            clid: None,
            ctx: None,
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

    pub fn with_clid_gen(mut self, clid: Option<Arc<XClIdGen>>) -> Self {
        self.clid = clid;
        self
    }

    /// Username currently holding the lease, if any.
    pub fn leased_username(&self) -> Option<&str> {
        self.ctx.as_ref().map(|c| c.account.username.as_str())
    }

    /// Acquires the lease up front. Returns false when the pool has no
    /// active accounts left.
    pub async fn open(&mut self) -> Result<bool> {
        Ok(self.ensure_ctx().await?.is_some())
    }

    /// Releases the lease and folds the successful-request count into the
    /// account's stats. Always call this on the normal path; dropping the
    /// client covers abandonment.
    pub async fn close(&mut self) -> Result<()> {
        self.close_ctx(None, false, None).await
    }

    async fn ensure_ctx(&mut self) -> Result<Option<(reqwest::Client, String)>> {
        if self.ctx.is_none() {
            let Some(account) = self.pool.get_for_queue_or_wait(&self.queue).await? else {
                return Ok(None);
            };
            let client = account.client(self.proxy.as_deref())?;
            self.ctx = Some(Ctx { account, client, req_count: 0 });
        }

        match &self.ctx {
            Some(ctx) => Ok(Some((ctx.client.clone(), ctx.account.username.clone()))),
            None => Ok(None),
        }
    }

    async fn close_ctx(
        &mut self,
        reset_at: Option<i64>,
        inactive: bool,
        msg: Option<String>,
    ) -> Result<()> {
        let Some(ctx) = self.ctx.take() else { return Ok(()) };
        let username = &ctx.account.username;

        if inactive {
            return self.pool.mark_inactive(username, msg.as_deref()).await;
        }

        if let Some(ts) = reset_at {
            return self
                .pool
                .lock_until(username, &self.queue, ts, ctx.req_count)
                .await;
        }

        self.pool.unlock(username, &self.queue, ctx.req_count).await
    }

    pub async fn get(&mut self, url: &str, params: &[(String, String)]) -> Result<Option<ApiRep>> {
        self.req(reqwest::Method::GET, url, params).await
    }

    pub async fn req(
        &mut self,
        method: reqwest::Method,
        url: &str,
        params: &[(String, String)],
    ) -> Result<Option<ApiRep>> {
        let mut unknown_retry = 0u32;
        let mut connect_retry = 0u32;

        loop {
            let Some((client, username)) = self.ensure_ctx().await? else {
                return Ok(None);
            };

            let mut builder = client.request(method.clone(), url).query(params);
            if let Some(gen) = &self.clid {
                let path = url::Url::parse(url)
                    .map(|u| u.path().to_string())
                    .unwrap_or_else(|_| url.to_string());
                builder = builder.header("x-client-transaction-id", gen.calc(method.as_str(), &path));
            }

            let resp = match builder.send().await {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() => {
                    log::debug!("read timeout on {username}, retrying same account: {e}");
                    continue;
                }
                Err(e) if e.is_connect() => {
                    connect_retry += 1;
                    if connect_retry >= CONNECT_RETRIES {
                        return Err(e.into());
                    }
                    continue;
                }
                Err(e) => {
                    unknown_retry += 1;
                    if unknown_retry >= UNKNOWN_RETRIES {
                        log::warn!(
                            "unknown transport error, account {username} timeouted for 15 minutes. \
                             unlock it early with `tws reset_locks` if this is a mistake. err: {e}"
                        );
                        self.close_ctx(Some(utc_ts() + PENALTY_SECS), false, None).await?;
                        return Err(Error::UnknownApi(e.to_string()));
                    }
                    continue;
                }
            };

            let rep = match ApiRep::read(resp, username.clone()).await {
                Ok(rep) => rep,
                Err(e) => {
                    unknown_retry += 1;
                    if unknown_retry >= UNKNOWN_RETRIES {
                        self.close_ctx(Some(utc_ts() + PENALTY_SECS), false, None).await?;
                        return Err(e);
                    }
                    continue;
                }
            };

            if self.debug {
                dump_rep(&rep);
            }

            let log_msg = format!("{:3} - {} - {}", rep.status, rep.request_id(), rep.error_msg);
            log::trace!("{log_msg}");

            match check_rep(&rep) {
                Verdict::Ok => {
                    if let Some(ctx) = self.ctx.as_mut() {
                        ctx.req_count += 1;
                    }
                    return Ok(Some(rep));
                }
                Verdict::OkWarn(msg) => {
                    log::warn!("API error (passed through): {msg} - {log_msg}");
                    if let Some(ctx) = self.ctx.as_mut() {
                        ctx.req_count += 1;
                    }
                    return Ok(Some(rep));
                }
                Verdict::RateLimited(reset_at) => {
                    log::debug!("rate limited: {log_msg}");
                    self.close_ctx(Some(reset_at), false, None).await?;
                }
                Verdict::Banned(msg) => {
                    log::warn!("ban detected: {log_msg}");
                    self.close_ctx(None, true, msg).await?;
                }
                Verdict::Retry(msg) => {
                    log::warn!("transient error, switching account: {msg}");
                    self.close_ctx(None, false, None).await?;
                }
                Verdict::Abort => {
                    log::warn!("dependency error (request skipped): {log_msg}");
                    return Ok(None);
                }
                Verdict::Fatal(msg) => {
                    log::error!("[DEV] update required: {msg}");
                    return Err(Error::StaleFeatures(msg));
                }
                Verdict::Unknown(msg) => {
                    unknown_retry += 1;
                    if unknown_retry >= UNKNOWN_RETRIES {
                        log::error!("unhandled API response: {log_msg}");
                        self.close_ctx(Some(utc_ts() + PENALTY_SECS), false, None).await?;
                        return Err(Error::UnknownApi(msg));
                    }
                }
            }
        }
    }
}

impl Drop for QueueClient {
    fn drop(&mut self) {
        // abandoned lease (early stream drop, cancellation): release it
        // from a detached task so the account never stays locked
        if let Some(ctx) = self.ctx.take() {
            let pool = self.pool.clone();
            let queue = self.queue.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let username = &ctx.account.username;
                    if let Err(e) = pool.unlock(username, &queue, ctx.req_count).await {
                        log::error!("failed to release lease for {username}: {e}");
                    }
                });
            }
        }
    }
}

fn dump_rep(rep: &ApiRep) {
    static SESSION_DIR: OnceLock<std::path::PathBuf> = OnceLock::new();
    static COUNT: AtomicUsize = AtomicUsize::new(0);

    let dir = SESSION_DIR.get_or_init(|| {
        let stamp = utc_now().format("%Y-%m-%d_%H-%M").to_string();
        std::env::temp_dir().join(format!("tws-{stamp}"))
    });

    let count = COUNT.fetch_add(1, Ordering::Relaxed);
    let file = dir.join(format!("{count:05}_{}_{}.txt", rep.status, rep.username));

    let mut msg = Vec::new();
    msg.push(format!("{count} - {}", rep.request_id()));
    msg.push(format!("{} GET {}", rep.status, rep.url));
    msg.push(String::new());
    msg.push(serde_json::to_string_pretty(&rep.body).unwrap_or_default());

    if std::fs::create_dir_all(dir).is_ok() {
        if let Err(e) = std::fs::write(&file, msg.join("\n")) {
            log::debug!("failed to dump response: {e}");
        }
    }
}

//! The durable account record: credentials, session material and per-queue
//! scheduling state, plus hydration of a ready-to-use HTTP client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use url::Url;

use crate::db::SqlArg;
use crate::error::Result;
use crate::ops::BEARER_TOKEN;
use crate::util::{parse_utc, to_utc_str};

/// Origin the session cookies belong to.
pub(crate) const API_ORIGIN: &str = "https://x.com";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

pub fn random_user_agent() -> String {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
        .to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,
    pub email: String,
    pub email_password: String,
    pub user_agent: String,
    pub active: bool,
    /// queue name -> lease deadline (UTC)
    pub locks: HashMap<String, DateTime<Utc>>,
    /// queue name -> cumulative successful requests
    pub stats: HashMap<String, i64>,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub mfa_code: Option<String>,
    pub proxy: Option<String>,
    pub error_msg: Option<String>,
    pub last_used: Option<DateTime<Utc>>,
    /// lease marker for stores without a returning clause
    pub tx: Option<String>,
}

/// Column order used by both [`Account::to_params`] and the pool's upsert.
pub(crate) const COLUMNS: &[&str] = &[
    "username",
    "password",
    "email",
    "email_password",
    "user_agent",
    "active",
    "locks",
    "stats",
    "headers",
    "cookies",
    "proxy",
    "error_msg",
    "last_used",
    "mfa_code",
    "_tx",
];

impl Account {
    pub fn from_row(row: &SqliteRow) -> Result<Self> {
        let locks_raw: String = row.try_get("locks")?;
        let locks: HashMap<String, String> =
            serde_json::from_str(&locks_raw).unwrap_or_default();
        let locks = locks
            .into_iter()
            .filter_map(|(k, v)| parse_utc(&v).map(|dt| (k, dt)))
            .collect();

        let stats_raw: String = row.try_get("stats")?;
        let stats: HashMap<String, serde_json::Value> =
            serde_json::from_str(&stats_raw).unwrap_or_default();
        let stats = stats
            .into_iter()
            .filter_map(|(k, v)| v.as_i64().map(|n| (k, n)))
            .collect();

        let headers_raw: String = row.try_get("headers")?;
        let cookies_raw: String = row.try_get("cookies")?;
        let last_used: Option<String> = row.try_get("last_used")?;

        Ok(Self {
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            email: row.try_get("email")?,
            email_password: row.try_get("email_password")?,
            user_agent: row.try_get("user_agent")?,
            active: row.try_get("active")?,
            locks,
            stats,
            headers: serde_json::from_str(&headers_raw).unwrap_or_default(),
            cookies: serde_json::from_str(&cookies_raw).unwrap_or_default(),
            mfa_code: row.try_get("mfa_code")?,
            proxy: row.try_get("proxy")?,
            error_msg: row.try_get("error_msg")?,
            last_used: last_used.as_deref().and_then(parse_utc),
            tx: row.try_get("_tx")?,
        })
    }

    /// Bind values in [`COLUMNS`] order.
    pub(crate) fn to_params(&self) -> Vec<SqlArg> {
        let locks: HashMap<&String, String> =
            self.locks.iter().map(|(k, v)| (k, to_utc_str(v))).collect();

        vec![
            SqlArg::from(&self.username),
            SqlArg::from(&self.password),
            SqlArg::from(&self.email),
            SqlArg::from(&self.email_password),
            SqlArg::from(&self.user_agent),
            SqlArg::from(self.active),
            SqlArg::from(serde_json::to_string(&locks).unwrap_or_else(|_| "{}".into())),
            SqlArg::from(serde_json::to_string(&self.stats).unwrap_or_else(|_| "{}".into())),
            SqlArg::from(serde_json::to_string(&self.headers).unwrap_or_else(|_| "{}".into())),
            SqlArg::from(serde_json::to_string(&self.cookies).unwrap_or_else(|_| "{}".into())),
            SqlArg::from(self.proxy.clone()),
            SqlArg::from(self.error_msg.clone()),
            SqlArg::from(self.last_used.as_ref().map(to_utc_str)),
            SqlArg::from(self.mfa_code.clone()),
            SqlArg::from(self.tx.clone()),
        ]
    }

    /// Whether a full authenticated session was ever persisted.
    pub fn logged_in(&self) -> bool {
        self.headers
            .get("authorization")
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    /// Builds the HTTP client for this account and exposes its cookie jar
    /// (the login flow reads session cookies back out of it).
    ///
    /// Header layering: persisted session headers first, then the fixed
    /// overrides, then the CSRF header when a `ct0` cookie is present.
    /// Proxy precedence: explicit argument, then `TWS_PROXY`, then the
    /// account's own proxy.
    pub fn client_with_jar(&self, proxy: Option<&str>) -> Result<(reqwest::Client, Arc<Jar>)> {
        let origin: Url = API_ORIGIN.parse().expect("static origin url");
        let jar = Arc::new(Jar::default());
        for (k, v) in &self.cookies {
            jar.add_cookie_str(&format!("{k}={v}; Domain=.x.com; Path=/"), &origin);
        }

        let mut headers = HeaderMap::new();
        for (k, v) in &self.headers {
            let name = HeaderName::from_bytes(k.as_bytes());
            let value = HeaderValue::from_str(v);
            if let (Ok(name), Ok(value)) = (name, value) {
                headers.insert(name, value);
            } else {
                log::debug!("skipping unusable persisted header {k}");
            }
        }

        set_header(&mut headers, "user-agent", &self.user_agent);
        set_header(&mut headers, "content-type", "application/json");
        set_header(&mut headers, "authorization", BEARER_TOKEN);
        set_header(&mut headers, "x-twitter-active-user", "yes");
        set_header(&mut headers, "x-twitter-client-language", "en");
        if let Some(ct0) = self.cookies.get("ct0") {
            set_header(&mut headers, "x-csrf-token", ct0);
        }

        let mut builder = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .default_headers(headers)
            .timeout(Duration::from_secs(30));

        let env_proxy = std::env::var("TWS_PROXY").ok();
        let proxy = proxy
            .map(str::to_string)
            .or(env_proxy)
            .or_else(|| self.proxy.clone());
        if let Some(p) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(&p)?);
        }

        let client = builder.build()?;
        Ok((client, jar))
    }

    pub fn client(&self, proxy: Option<&str>) -> Result<reqwest::Client> {
        Ok(self.client_with_jar(proxy)?.0)
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logged_in_requires_authorization_header() {
        let mut acc = Account {
            username: "u1".into(),
            ..Default::default()
        };
        assert!(!acc.logged_in());

        acc.headers.insert("authorization".into(), String::new());
        assert!(!acc.logged_in());

        acc.headers.insert("authorization".into(), BEARER_TOKEN.into());
        assert!(acc.logged_in());
    }

    #[test]
    fn client_builds_with_session_material() {
        let mut acc = Account {
            username: "u1".into(),
            user_agent: random_user_agent(),
            ..Default::default()
        };
        acc.cookies.insert("ct0".into(), "csrf-val".into());
        acc.headers.insert("x-some-header".into(), "1".into());
        // bad persisted header names are skipped, not fatal
        acc.headers.insert("bad header\n".into(), "x".into());

        assert!(acc.client(None).is_ok());
    }
}

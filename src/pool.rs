//! The accounts pool: durable account administration plus the per-queue
//! lease scheduler.
//!
//! A lease hands one account to one caller for one queue for a bounded
//! window (15 minutes unless the remote's rate-limit reset extends it).
//! The grant is a single atomic statement so concurrent callers on the
//! same queue can never receive the same account.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};

use crate::account::{random_user_agent, Account, COLUMNS};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::login::{login, LoginConfig};
use crate::params;
use crate::util::{env_bool, parse_cookies, parse_utc, utc_now, utc_ts};

const LEASE_MINUTES: i64 = 15;
const WAIT_POLL_SECS: u64 = 5;

/// Lease pick order when several accounts are eligible.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccountOrder {
    #[default]
    Username,
    Random,
}

impl AccountOrder {
    fn sql(&self) -> &'static str {
        match self {
            AccountOrder::Username => "username",
            AccountOrder::Random => "RANDOM()",
        }
    }
}

/// Optional fields accepted by [`AccountsPool::add_account`].
#[derive(Clone, Debug, Default)]
pub struct AccountExtras {
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub cookies: Option<String>,
    pub mfa_code: Option<String>,
}

/// Per-account summary for ops tooling.
#[derive(Clone, Debug)]
pub struct AccountInfo {
    pub username: String,
    pub logged_in: bool,
    pub active: bool,
    pub last_used: Option<DateTime<Utc>>,
    pub total_req: i64,
    pub error_msg: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoginStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct AccountsPool {
    db: Db,
    login_config: LoginConfig,
    raise_when_no_account: bool,
    order: AccountOrder,
}

impl AccountsPool {
    pub fn new(db_file: impl Into<String>) -> Self {
        Self {
            db: Db::new(db_file),
            login_config: LoginConfig::default(),
            raise_when_no_account: false,
            order: AccountOrder::default(),
        }
    }

    pub fn with_login_config(mut self, cfg: LoginConfig) -> Self {
        self.login_config = cfg;
        self
    }

    pub fn with_raise_when_no_account(mut self, raise: bool) -> Self {
        self.raise_when_no_account = raise;
        self
    }

    pub fn with_order(mut self, order: AccountOrder) -> Self {
        self.order = order;
        self
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Bulk import from a delimited file. `line_format` names the columns
    /// with the literal tokens `username`, `password`, `email`,
    /// `email_password` (all required) plus optional `user_agent`, `proxy`,
    /// `cookies`, `mfa_code`; `_` skips a column. The delimiter is whatever
    /// character sits next to `username` in the format string.
    pub async fn load_from_file(&self, filepath: &str, line_format: &str) -> Result<()> {
        let delim = guess_delim(line_format)
            .ok_or_else(|| Error::InvalidLineFormat(line_format.to_string()))?;
        let tokens: Vec<&str> = line_format.split(delim).collect();

        for required in ["username", "password", "email", "email_password"] {
            if !tokens.contains(&required) {
                return Err(Error::InvalidLineFormat(line_format.to_string()));
            }
        }

        let content = tokio::fs::read_to_string(filepath).await?;
        for line in content.lines().map(str::trim).filter(|x| !x.is_empty()) {
            let data: Vec<&str> = line.split(delim).map(str::trim).collect();
            if data.len() < tokens.len() {
                return Err(Error::InvalidLineFormat(format!("invalid line: {line}")));
            }

            let mut vals: BTreeMap<&str, &str> = BTreeMap::new();
            for (k, v) in tokens.iter().zip(data.iter()) {
                if *k != "_" {
                    vals.insert(k, v);
                }
            }

            let extras = AccountExtras {
                user_agent: vals.get("user_agent").map(|x| x.to_string()),
                proxy: vals.get("proxy").map(|x| x.to_string()),
                cookies: vals.get("cookies").map(|x| x.to_string()),
                mfa_code: vals.get("mfa_code").map(|x| x.to_string()),
            };
            self.add_account(
                vals["username"],
                vals["password"],
                vals["email"],
                vals["email_password"],
                extras,
            )
            .await?;
        }

        Ok(())
    }

    /// Inserts a new account. A duplicate username (case-insensitive) is a
    /// warning and a no-op. When the supplied cookies already carry a `ct0`
    /// session token the account starts out active, skipping login.
    pub async fn add_account(
        &self,
        username: &str,
        password: &str,
        email: &str,
        email_password: &str,
        extras: AccountExtras,
    ) -> Result<()> {
        let qs = "SELECT username FROM accounts WHERE username = ?";
        if self.db.fetch_one(qs, params![username]).await?.is_some() {
            log::warn!("account {username} already exists");
            return Ok(());
        }

        let cookies = match &extras.cookies {
            Some(raw) => parse_cookies(raw)?,
            None => Default::default(),
        };

        let account = Account {
            username: username.to_string(),
            password: password.to_string(),
            email: email.to_string(),
            email_password: email_password.to_string(),
            user_agent: extras.user_agent.unwrap_or_else(random_user_agent),
            active: cookies.contains_key("ct0"),
            cookies,
            proxy: extras.proxy,
            mfa_code: extras.mfa_code,
            ..Default::default()
        };

        self.save(&account).await?;
        log::info!("account {username} added successfully (active={})", account.active);
        Ok(())
    }

    pub async fn delete_accounts(&self, usernames: &[String]) -> Result<()> {
        let mut names: Vec<&String> = usernames.iter().collect();
        names.sort();
        names.dedup();
        if names.is_empty() {
            log::warn!("no usernames provided");
            return Ok(());
        }

        let marks = vec!["?"; names.len()].join(",");
        let qs = format!("DELETE FROM accounts WHERE username IN ({marks})");
        let args = names.into_iter().map(Into::into).collect();
        self.db.execute(&qs, args).await?;
        Ok(())
    }

    pub async fn delete_inactive(&self) -> Result<u64> {
        self.db
            .execute("DELETE FROM accounts WHERE active = false", params![])
            .await
    }

    pub async fn get(&self, username: &str) -> Result<Account> {
        self.get_account(username)
            .await?
            .ok_or_else(|| Error::AccountNotFound(username.to_string()))
    }

    pub async fn get_account(&self, username: &str) -> Result<Option<Account>> {
        let qs = "SELECT * FROM accounts WHERE username = ?";
        match self.db.fetch_one(qs, params![username]).await? {
            Some(row) => Ok(Some(Account::from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_all(&self) -> Result<Vec<Account>> {
        let rows = self.db.fetch_all("SELECT * FROM accounts", params![]).await?;
        rows.iter().map(Account::from_row).collect()
    }

    /// Upsert on username.
    pub async fn save(&self, account: &Account) -> Result<()> {
        let cols = COLUMNS.join(",");
        let marks = vec!["?"; COLUMNS.len()].join(",");
        let updates: Vec<String> =
            COLUMNS.iter().map(|c| format!("{c}=excluded.{c}")).collect();
        let qs = format!(
            "INSERT INTO accounts ({cols}) VALUES ({marks}) \
             ON CONFLICT(username) DO UPDATE SET {}",
            updates.join(",")
        );
        self.db.execute(&qs, account.to_params()).await?;
        Ok(())
    }

    pub async fn set_active(&self, username: &str, active: bool) -> Result<()> {
        let qs = "UPDATE accounts SET active = ? WHERE username = ?";
        self.db.execute(qs, params![active, username]).await?;
        Ok(())
    }

    /// Drives the login flow for one account. Failures are captured on the
    /// account record; the account is saved either way.
    pub async fn login(&self, account: &mut Account) -> bool {
        let res = login(account, &self.login_config).await;
        match &res {
            Ok(()) => log::info!("logged in to {} successfully", account.username),
            Err(e) => {
                if account.error_msg.is_none() {
                    account.error_msg = Some(e.to_string());
                }
                log::error!("failed to login '{}': {e}", account.username);
            }
        }

        if let Err(e) = self.save(account).await {
            log::error!("failed to save account '{}': {e}", account.username);
        }
        res.is_ok()
    }

    /// Logs in the given accounts, or every inactive account without a
    /// recorded error when no names are passed.
    pub async fn login_all(&self, usernames: Option<&[String]>) -> Result<LoginStats> {
        let mut accounts = match usernames {
            None => {
                let qs = "SELECT * FROM accounts WHERE active = false AND error_msg IS NULL";
                let rows = self.db.fetch_all(qs, params![]).await?;
                rows.iter().map(Account::from_row).collect::<Result<Vec<_>>>()?
            }
            Some(names) => {
                let marks = vec!["?"; names.len()].join(",");
                let qs = format!("SELECT * FROM accounts WHERE username IN ({marks})");
                let args = names.iter().map(Into::into).collect();
                let rows = self.db.fetch_all(&qs, args).await?;
                rows.iter().map(Account::from_row).collect::<Result<Vec<_>>>()?
            }
        };

        let mut stats = LoginStats { total: accounts.len(), ..Default::default() };
        for (i, account) in accounts.iter_mut().enumerate() {
            log::info!(
                "[{}/{}] logging in {} - {}",
                i + 1,
                stats.total,
                account.username,
                account.email
            );
            if self.login(account).await {
                stats.success += 1;
            } else {
                stats.failed += 1;
            }
        }
        Ok(stats)
    }

    /// Wipes session material and re-runs login for the given accounts.
    pub async fn relogin(&self, usernames: &[String]) -> Result<LoginStats> {
        let mut names: Vec<&String> = usernames.iter().collect();
        names.sort();
        names.dedup();
        if names.is_empty() {
            log::warn!("no usernames provided");
            return Ok(LoginStats::default());
        }

        let marks = vec!["?"; names.len()].join(",");
        let qs = format!(
            "UPDATE accounts SET
                active = false,
                locks = json_object(),
                last_used = NULL,
                error_msg = NULL,
                headers = json_object(),
                cookies = json_object(),
                user_agent = ?
            WHERE username IN ({marks})"
        );
        let mut args = params![random_user_agent()];
        args.extend(names.iter().map(|n| (*n).into()));
        self.db.execute(&qs, args).await?;

        let owned: Vec<String> = names.into_iter().cloned().collect();
        self.login_all(Some(&owned)).await
    }

    pub async fn relogin_failed(&self) -> Result<LoginStats> {
        let qs = "SELECT username FROM accounts WHERE active = false AND error_msg IS NOT NULL";
        let rows = self.db.fetch_all(qs, params![]).await?;
        let names: Vec<String> = rows
            .iter()
            .map(|r| sqlx::Row::get::<String, _>(r, "username"))
            .collect();
        self.relogin(&names).await
    }

    pub async fn reset_locks(&self) -> Result<()> {
        self.db
            .execute("UPDATE accounts SET locks = json_object()", params![])
            .await?;
        Ok(())
    }

    /// Extends the lease for `queue` to an explicit deadline (unix seconds),
    /// folding `req_count` successful requests into the stats.
    pub async fn lock_until(
        &self,
        username: &str,
        queue: &str,
        unlock_at: i64,
        req_count: i64,
    ) -> Result<()> {
        let qs = format!(
            "UPDATE accounts SET
                locks = json_set(locks, '$.{queue}', datetime(?, 'unixepoch')),
                stats = json_set(stats, '$.{queue}', COALESCE(json_extract(stats, '$.{queue}'), 0) + ?),
                last_used = datetime(?, 'unixepoch')
            WHERE username = ?"
        );
        self.db
            .execute(&qs, params![unlock_at, req_count, utc_ts(), username])
            .await?;
        Ok(())
    }

    /// Releases the lease for `queue`, folding `req_count` into the stats.
    pub async fn unlock(&self, username: &str, queue: &str, req_count: i64) -> Result<()> {
        let qs = format!(
            "UPDATE accounts SET
                locks = json_remove(locks, '$.{queue}'),
                stats = json_set(stats, '$.{queue}', COALESCE(json_extract(stats, '$.{queue}'), 0) + ?),
                last_used = datetime(?, 'unixepoch')
            WHERE username = ?"
        );
        self.db
            .execute(&qs, params![req_count, utc_ts(), username])
            .await?;
        Ok(())
    }

    /// Atomically leases one eligible account to `queue` for 15 minutes.
    ///
    /// With a returning-clause runtime this is a single statement. Older
    /// runtimes emulate it by stamping a fresh unique marker in the update
    /// and selecting it back.
    pub async fn get_for_queue(&self, queue: &str) -> Result<Option<Account>> {
        let cond = format!(
            "SELECT username FROM accounts
            WHERE active = true AND (
                locks IS NULL
                OR json_extract(locks, '$.{queue}') IS NULL
                OR json_extract(locks, '$.{queue}') < datetime('now')
            )
            ORDER BY {}
            LIMIT 1",
            self.order.sql()
        );

        let update = format!(
            "locks = json_set(locks, '$.{queue}', datetime('now', '+{LEASE_MINUTES} minutes')),
             last_used = datetime(?, 'unixepoch')"
        );

        if self.db.supports_returning().await? {
            let qs = format!(
                "UPDATE accounts SET {update} WHERE username = ({cond}) RETURNING *"
            );
            let row = self.db.execute_returning(&qs, params![utc_ts()]).await?;
            return row.as_ref().map(Account::from_row).transpose();
        }

        let marker = uuid::Uuid::new_v4().simple().to_string();
        let qs = format!(
            "UPDATE accounts SET {update}, _tx = ? WHERE username = ({cond})"
        );
        self.db.execute(&qs, params![utc_ts(), &marker]).await?;

        let row = self
            .db
            .fetch_one("SELECT * FROM accounts WHERE _tx = ?", params![marker])
            .await?;
        row.as_ref().map(Account::from_row).transpose()
    }

    /// Like [`Self::get_for_queue`] but polls every 5 seconds until an
    /// account frees up. Raises [`Error::NoAccount`] when configured to (or
    /// `TWS_RAISE_WHEN_NO_ACCOUNT` is set); returns `None` when the pool has
    /// no active accounts left at all.
    pub async fn get_for_queue_or_wait(&self, queue: &str) -> Result<Option<Account>> {
        let mut msg_shown = false;
        loop {
            match self.get_for_queue(queue).await? {
                Some(account) => {
                    if msg_shown {
                        log::info!(
                            "continuing with account {} on queue {queue}",
                            account.username
                        );
                    }
                    return Ok(Some(account));
                }
                None => {
                    if self.raise_when_no_account || env_bool("TWS_RAISE_WHEN_NO_ACCOUNT") {
                        return Err(Error::NoAccount(queue.to_string()));
                    }

                    if !msg_shown {
                        let Some(nat) = self.next_available_at(queue).await? else {
                            log::warn!("no active accounts. stopping...");
                            return Ok(None);
                        };
                        log::info!(
                            "no account available for queue \"{queue}\". next available at {nat}"
                        );
                        msg_shown = true;
                    }

                    tokio::time::sleep(Duration::from_secs(WAIT_POLL_SECS)).await;
                }
            }
        }
    }

    /// Earliest future lease deadline for `queue` across active accounts,
    /// rendered as local `HH:MM:SS` ("now" when already in the past).
    pub async fn next_available_at(&self, queue: &str) -> Result<Option<String>> {
        let qs = format!(
            "SELECT json_extract(locks, '$.\"{queue}\"') as lock_until
            FROM accounts
            WHERE active = true AND json_extract(locks, '$.\"{queue}\"') IS NOT NULL
            ORDER BY lock_until ASC
            LIMIT 1"
        );
        let row = self.db.fetch_one(&qs, params![]).await?;

        let Some(row) = row else { return Ok(None) };
        let raw: String = sqlx::Row::get(&row, "lock_until");
        let Some(target) = parse_utc(&raw) else { return Ok(None) };

        let now = utc_now();
        if target < now {
            return Ok(Some("now".to_string()));
        }

        let at_local = Local::now() + (target - now);
        Ok(Some(at_local.format("%H:%M:%S").to_string()))
    }

    pub async fn mark_inactive(&self, username: &str, error_msg: Option<&str>) -> Result<()> {
        let qs = "UPDATE accounts SET active = false, error_msg = ? WHERE username = ?";
        self.db.execute(qs, params![error_msg.map(str::to_string), username]).await?;
        Ok(())
    }

    /// Pool-level counters: total/active/inactive plus a `locked_<queue>`
    /// count for every queue that currently appears in any locks map.
    pub async fn stats(&self) -> Result<BTreeMap<String, i64>> {
        let qs = "SELECT DISTINCT(f.key) as k FROM accounts, json_each(locks) f";
        let rows = self.db.fetch_all(qs, params![]).await?;
        let queues: Vec<String> = rows
            .iter()
            .map(|r| sqlx::Row::get::<String, _>(r, "k"))
            .collect();

        let mut selects: Vec<(String, String)> = vec![
            ("total".into(), "SELECT COUNT(*) FROM accounts".into()),
            ("active".into(), "SELECT COUNT(*) FROM accounts WHERE active = true".into()),
            ("inactive".into(), "SELECT COUNT(*) FROM accounts WHERE active = false".into()),
        ];
        for q in &queues {
            selects.push((
                format!("locked_{q}"),
                format!(
                    "SELECT COUNT(*) FROM accounts
                    WHERE json_extract(locks, '$.{q}') IS NOT NULL
                        AND json_extract(locks, '$.{q}') > datetime('now')"
                ),
            ));
        }

        let body: Vec<String> =
            selects.iter().map(|(k, q)| format!("({q}) as {k}")).collect();
        let qs = format!("SELECT {}", body.join(","));
        let row = self.db.fetch_one(&qs, params![]).await?;

        let mut res = BTreeMap::new();
        if let Some(row) = row {
            for (i, (k, _)) in selects.iter().enumerate() {
                res.insert(k.clone(), sqlx::Row::get::<i64, _>(&row, i));
            }
        }
        Ok(res)
    }

    /// Per-account summaries sorted for display: active accounts first,
    /// then most-recently-used (never-used accounts sink), then username.
    pub async fn accounts_info(&self) -> Result<Vec<AccountInfo>> {
        let accounts = self.get_all().await?;

        let mut items: Vec<AccountInfo> = accounts
            .into_iter()
            .map(|x| AccountInfo {
                logged_in: x.logged_in(),
                active: x.active,
                last_used: x.last_used,
                total_req: x.stats.values().sum(),
                error_msg: x.error_msg.map(|e| e.chars().take(60).collect()),
                username: x.username,
            })
            .collect();

        items.sort_by_key(|x| x.username.to_lowercase());
        items.sort_by_key(|x| {
            std::cmp::Reverse(if x.total_req > 0 {
                x.last_used.map(|d| d.timestamp()).unwrap_or(0)
            } else {
                0
            })
        });
        items.sort_by_key(|x| std::cmp::Reverse(x.active));
        Ok(items)
    }
}

fn guess_delim(line_format: &str) -> Option<char> {
    let (left, right) = line_format.split_once("username")?;
    left.chars().last().or_else(|| right.chars().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::temp_db_path;

    fn pool(name: &str) -> AccountsPool {
        AccountsPool::new(temp_db_path(name))
    }

    async fn add(pool: &AccountsPool, n: u32) {
        pool.add_account(
            &format!("user{n}"),
            &format!("pass{n}"),
            &format!("email{n}"),
            &format!("email_pass{n}"),
            AccountExtras::default(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn add_account_is_idempotent_case_insensitive() {
        let pool = pool("add");
        add(&pool, 1).await;

        let acc = pool.get("user1").await.unwrap();
        assert_eq!(acc.password, "pass1");
        assert_eq!(acc.email, "email1");
        assert!(!acc.active);

        // same username: no-op
        pool.add_account("user1", "pass2", "email2", "email_pass2", Default::default())
            .await
            .unwrap();
        assert_eq!(pool.get("user1").await.unwrap().password, "pass1");

        // different case: still a duplicate
        pool.add_account("USER1", "pass2", "email2", "email_pass2", Default::default())
            .await
            .unwrap();
        assert_eq!(pool.get("user1").await.unwrap().password, "pass1");
        assert_eq!(pool.get_all().await.unwrap().len(), 1);

        add(&pool, 2).await;
        assert_eq!(pool.get_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn add_account_with_session_cookies_is_active() {
        let pool = pool("cookies");
        let extras = AccountExtras {
            cookies: Some("ct0=abc; auth_token=def".into()),
            ..Default::default()
        };
        pool.add_account("user1", "p", "e", "ep", extras).await.unwrap();

        let acc = pool.get("user1").await.unwrap();
        assert!(acc.active);
        assert_eq!(acc.cookies.get("ct0").map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn save_round_trips_and_ignores_renames() {
        let pool = pool("save");
        add(&pool, 1).await;

        let mut acc = pool.get("user1").await.unwrap();
        acc.password = "pass2".into();
        acc.stats.insert("SearchTimeline".into(), 10);
        acc.locks.insert("SearchTimeline".into(), utc_now());
        pool.save(&acc).await.unwrap();

        let loaded = pool.get("user1").await.unwrap();
        assert_eq!(loaded.password, "pass2");
        assert_eq!(loaded.stats.get("SearchTimeline"), Some(&10));
        assert!(loaded.locks.contains_key("SearchTimeline"));

        // saving an unchanged record is byte-stable
        pool.save(&loaded).await.unwrap();
        let again = pool.get("user1").await.unwrap();
        assert_eq!(again.locks, loaded.locks);
        assert_eq!(again.stats, loaded.stats);

        // a renamed record is a new row, not an update of the old one
        let mut renamed = loaded.clone();
        renamed.username = "user2".into();
        pool.save(&renamed).await.unwrap();
        assert_eq!(pool.get("user1").await.unwrap().password, "pass2");
    }

    #[tokio::test]
    async fn get_for_queue_leases_atomically() {
        let pool = pool("lease");
        let q = "test_queue";
        add(&pool, 1).await;
        pool.set_active("user1", true).await.unwrap();

        let acc = pool.get_for_queue(q).await.unwrap().unwrap();
        assert_eq!(acc.username, "user1");
        assert!(acc.active);
        let deadline = acc.locks.get(q).copied().unwrap();
        assert!(deadline > utc_now());

        // already leased: nothing to hand out
        assert!(pool.get_for_queue(q).await.unwrap().is_none());

        // a different queue is unaffected
        assert!(pool.get_for_queue("other_queue").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unlock_and_lock_until_update_state() {
        let pool = pool("unlock");
        let q = "test_queue";
        add(&pool, 1).await;
        pool.set_active("user1", true).await.unwrap();

        let acc = pool.get_for_queue(q).await.unwrap().unwrap();
        assert!(acc.locks.contains_key(q));

        pool.unlock("user1", q, 3).await.unwrap();
        let acc = pool.get("user1").await.unwrap();
        assert!(!acc.locks.contains_key(q));
        assert_eq!(acc.stats.get(q), Some(&3));
        assert!(acc.last_used.is_some());

        // leasable again after unlock
        assert!(pool.get_for_queue(q).await.unwrap().is_some());

        let end_time = utc_ts() + 60;
        pool.lock_until("user1", q, end_time, 2).await.unwrap();
        let acc = pool.get("user1").await.unwrap();
        assert_eq!(acc.locks.get(q).map(|d| d.timestamp()), Some(end_time));
        assert_eq!(acc.stats.get(q), Some(&5));
    }

    #[tokio::test]
    async fn concurrent_leases_never_share_an_account() {
        let pool = pool("concurrent");
        let q = "test_queue";
        for n in 1..=4 {
            add(&pool, n).await;
            pool.set_active(&format!("user{n}"), true).await.unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let p = pool.clone();
            tasks.push(tokio::spawn(async move {
                p.get_for_queue(q).await.unwrap().map(|a| a.username)
            }));
        }

        let mut names = Vec::new();
        for t in tasks {
            if let Some(name) = t.await.unwrap() {
                names.push(name);
            }
        }
        let unique: std::collections::HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len(), "duplicate lease: {names:?}");
    }

    #[tokio::test]
    async fn reset_locks_clears_every_queue() {
        let pool = pool("reset");
        add(&pool, 1).await;
        pool.set_active("user1", true).await.unwrap();
        pool.get_for_queue("q1").await.unwrap();
        pool.get_for_queue("q2").await.unwrap();

        pool.reset_locks().await.unwrap();
        let acc = pool.get("user1").await.unwrap();
        assert!(acc.locks.is_empty());
        assert_eq!(pool.next_available_at("q1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn next_available_at_estimates_lease_expiry() {
        let pool = pool("nat");
        let q = "test_queue";
        add(&pool, 1).await;
        pool.set_active("user1", true).await.unwrap();

        assert_eq!(pool.next_available_at(q).await.unwrap(), None);

        pool.lock_until("user1", q, utc_ts() + 90, 0).await.unwrap();
        assert!(pool.get_for_queue(q).await.unwrap().is_none());

        let expected = (Local::now() + chrono::Duration::seconds(90))
            .format("%H:%M:%S")
            .to_string();
        let nat = pool.next_available_at(q).await.unwrap().unwrap();
        // allow a tick of slack around second boundaries
        assert!(nat == expected || parse_hms_close(&nat, &expected), "{nat} vs {expected}");

        pool.lock_until("user1", q, utc_ts() - 10, 0).await.unwrap();
        assert_eq!(pool.next_available_at(q).await.unwrap().as_deref(), Some("now"));
    }

    fn parse_hms_close(a: &str, b: &str) -> bool {
        fn secs(s: &str) -> i64 {
            let p: Vec<i64> = s.split(':').filter_map(|x| x.parse().ok()).collect();
            p.first().unwrap_or(&0) * 3600 + p.get(1).unwrap_or(&0) * 60 + p.get(2).unwrap_or(&0)
        }
        (secs(a) - secs(b)).abs() <= 2
    }

    #[tokio::test]
    async fn mark_inactive_records_reason() {
        let pool = pool("inactive");
        add(&pool, 1).await;
        pool.set_active("user1", true).await.unwrap();

        pool.mark_inactive("user1", Some("(64) Your account is suspended")).await.unwrap();
        let acc = pool.get("user1").await.unwrap();
        assert!(!acc.active);
        assert_eq!(acc.error_msg.as_deref(), Some("(64) Your account is suspended"));

        assert!(pool.get_for_queue("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_counts_totals_and_locked_queues() {
        let pool = pool("stats");
        let q = "search";

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.get("total"), Some(&0));

        add(&pool, 1).await;
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.get("total"), Some(&1));
        assert_eq!(stats.get("active"), Some(&0));

        pool.set_active("user1", true).await.unwrap();
        pool.get_for_queue(q).await.unwrap();
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.get("active"), Some(&1));
        assert_eq!(stats.get("locked_search"), Some(&1));
    }

    #[tokio::test]
    async fn delete_accounts_and_inactive() {
        let pool = pool("delete");
        add(&pool, 1).await;
        add(&pool, 2).await;
        pool.set_active("user2", true).await.unwrap();

        pool.delete_accounts(&["user1".to_string()]).await.unwrap();
        assert_eq!(pool.get_all().await.unwrap().len(), 1);

        add(&pool, 3).await;
        pool.delete_inactive().await.unwrap();
        let left = pool.get_all().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].username, "user2");
    }

    #[tokio::test]
    async fn load_from_file_guesses_delimiter() {
        let pool = pool("load");
        let path = std::env::temp_dir().join(format!("tws_accounts_{}.txt", std::process::id()));
        tokio::fs::write(&path, "u1:p1:e1:ep1:extra\nu2:p2:e2:ep2:x\n").await.unwrap();

        pool.load_from_file(
            path.to_str().unwrap(),
            "username:password:email:email_password:_",
        )
        .await
        .unwrap();

        let all = pool.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].email_password, "ep1");

        let err = pool
            .load_from_file(path.to_str().unwrap(), "username:password")
            .await;
        assert!(err.is_err());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn accounts_info_sorts_active_first() {
        let pool = pool("info");
        add(&pool, 1).await;
        add(&pool, 2).await;
        pool.set_active("user2", true).await.unwrap();
        pool.unlock("user2", "q", 7).await.unwrap();

        let info = pool.accounts_info().await.unwrap();
        assert_eq!(info[0].username, "user2");
        assert_eq!(info[0].total_req, 7);
        assert!(info[0].active);
        assert!(!info[1].active);
    }
}

//! Pooled, rate-limit-aware client for the X/Twitter GraphQL API.
//!
//! Many authenticated accounts back one logical client: each request leases
//! an eligible account for its queue, rate limits and bans feed back into
//! durable per-account scheduling state, and cursored operations stream raw
//! pages until the remote runs dry.
//!
//! Entry points: [`AccountsPool`] for account administration and
//! [`Api`] for the scraping operations.

pub mod account;
pub mod api;
pub mod db;
pub mod error;
pub mod imap;
pub mod login;
pub mod ops;
pub mod pool;
pub mod queue_client;
pub mod util;
pub mod xclid;

pub use account::Account;
pub use api::{gather, Api};
pub use db::Db;
pub use error::{Error, Result};
pub use login::LoginConfig;
pub use pool::{AccountExtras, AccountInfo, AccountOrder, AccountsPool, LoginStats};
pub use queue_client::{ApiRep, QueueClient};
pub use xclid::XClIdGen;

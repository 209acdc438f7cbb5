//! Command-line front-end over the pool and the API.

use clap::{Parser, Subcommand};
use futures::pin_mut;
use futures_util::StreamExt;

use tws::{AccountsPool, Api, ApiRep, LoginConfig, Result};

#[derive(Parser)]
#[command(name = "tws", version, about = "Pooled X/Twitter GraphQL scraper")]
struct Cli {
    /// Accounts database file
    #[arg(long, default_value = "accounts.db", global = true)]
    db: String,

    /// Enable debug mode (response dumps + verbose logging)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
#[command(rename_all = "snake_case")]
enum Command {
    /// Show version
    Version,
    /// List all accounts
    Accounts,
    /// Get current usage stats
    Stats,
    /// Add accounts from a delimited file
    AddAccounts {
        file_path: String,
        /// Column names split by the same delimiter as the file,
        /// e.g. "username:password:email:email_password"
        line_format: String,
    },
    /// Delete accounts
    DelAccounts { usernames: Vec<String> },
    /// Login all new accounts
    LoginAccounts {
        #[arg(long)]
        email_first: bool,
        #[arg(long)]
        manual: bool,
    },
    /// Re-login selected accounts
    Relogin {
        usernames: Vec<String>,
        #[arg(long)]
        email_first: bool,
    },
    /// Retry login for failed accounts
    ReloginFailed {
        #[arg(long)]
        email_first: bool,
    },
    /// Reset all locks
    ResetLocks,
    /// Delete inactive accounts
    DeleteInactive,

    /// Search for tweets
    Search {
        query: String,
        #[arg(long, default_value_t = -1)]
        limit: i64,
        #[arg(long)]
        raw: bool,
    },
    /// Get tweet details
    TweetDetails {
        tweet_id: u64,
        #[arg(long)]
        raw: bool,
    },
    /// Get replies of a tweet
    TweetReplies {
        tweet_id: u64,
        #[arg(long, default_value_t = -1)]
        limit: i64,
        #[arg(long)]
        raw: bool,
    },
    /// Get retweeters of a tweet
    Retweeters {
        tweet_id: u64,
        #[arg(long, default_value_t = -1)]
        limit: i64,
        #[arg(long)]
        raw: bool,
    },
    /// Get favoriters of a tweet
    Favoriters {
        tweet_id: u64,
        #[arg(long, default_value_t = -1)]
        limit: i64,
        #[arg(long)]
        raw: bool,
    },
    /// Get user data by ID
    UserById {
        user_id: u64,
        #[arg(long)]
        raw: bool,
    },
    /// Get user data by username
    UserByLogin {
        username: String,
        #[arg(long)]
        raw: bool,
    },
    /// Get user followers
    Followers {
        user_id: u64,
        #[arg(long, default_value_t = -1)]
        limit: i64,
        #[arg(long)]
        raw: bool,
    },
    /// Get user following
    Following {
        user_id: u64,
        #[arg(long, default_value_t = -1)]
        limit: i64,
        #[arg(long)]
        raw: bool,
    },
    /// Get user tweets
    UserTweets {
        user_id: u64,
        #[arg(long, default_value_t = -1)]
        limit: i64,
        #[arg(long)]
        raw: bool,
    },
    /// Get user tweets and replies
    UserTweetsAndReplies {
        user_id: u64,
        #[arg(long, default_value_t = -1)]
        limit: i64,
        #[arg(long)]
        raw: bool,
    },
    /// Get tweets from a list
    ListTimeline {
        list_id: u64,
        #[arg(long, default_value_t = -1)]
        limit: i64,
        #[arg(long)]
        raw: bool,
    },
}

fn print_one(rep: Option<ApiRep>) {
    match rep {
        Some(rep) => println!("{}", rep.body),
        None => println!("Not Found."),
    }
}

async fn print_stream(stream: impl futures::Stream<Item = Result<ApiRep>>) -> Result<()> {
    pin_mut!(stream);
    while let Some(rep) = stream.next().await {
        println!("{}", rep?.body);
    }
    Ok(())
}

fn print_table(rows: &[Vec<String>]) {
    if rows.is_empty() {
        return;
    }

    let cols = rows[0].len();
    let widths: Vec<usize> = (0..cols)
        .map(|i| rows.iter().map(|r| r.get(i).map_or(0, String::len)).max().unwrap_or(0) + 1)
        .collect();

    for row in rows {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, v)| format!("{v:<width$}", width = widths[i]))
            .collect();
        println!("{}", line.join(" ").trim_end());
    }
}

fn fmt_opt_time(t: Option<chrono::DateTime<chrono::Utc>>) -> String {
    t.map(|x| x.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_default()
}

async fn cmd_accounts(pool: &AccountsPool) -> Result<()> {
    let mut rows = vec![vec![
        "username".to_string(),
        "logged_in".to_string(),
        "active".to_string(),
        "last_used".to_string(),
        "total_req".to_string(),
        "error_msg".to_string(),
    ]];
    for info in pool.accounts_info().await? {
        rows.push(vec![
            info.username,
            info.logged_in.to_string(),
            info.active.to_string(),
            fmt_opt_time(info.last_used),
            info.total_req.to_string(),
            info.error_msg.unwrap_or_default(),
        ]);
    }
    print_table(&rows);
    Ok(())
}

async fn cmd_stats(pool: &AccountsPool) -> Result<()> {
    let stats = pool.stats().await?;
    let total = stats.get("total").copied().unwrap_or(0);
    let active = stats.get("active").copied().unwrap_or(0);
    let inactive = stats.get("inactive").copied().unwrap_or(0);

    let mut locked: Vec<(String, i64)> = stats
        .iter()
        .filter(|(k, v)| k.starts_with("locked_") && **v > 0)
        .map(|(k, v)| (k.trim_start_matches("locked_").to_string(), *v))
        .collect();
    locked.sort_by_key(|(_, v)| std::cmp::Reverse(*v));

    let mut rows = vec![vec!["queue".to_string(), "locked".to_string(), "available".to_string()]];
    for (queue, count) in locked {
        rows.push(vec![queue, count.to_string(), (active - count).max(0).to_string()]);
    }
    print_table(&rows);
    println!("Total: {total} - Active: {active} - Inactive: {inactive}");
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    if let Command::Version = cli.command {
        let db = tws::Db::new(&cli.db);
        println!("tws: {}", env!("CARGO_PKG_VERSION"));
        println!("SQLite runtime: {}", db.sqlite_version().await?);
        return Ok(());
    }

    let pool = AccountsPool::new(&cli.db);
    let api = Api::new(pool.clone()).with_debug(cli.debug);

    match cli.command {
        Command::Version => unreachable!("handled above"),
        Command::Accounts => cmd_accounts(&pool).await?,
        Command::Stats => cmd_stats(&pool).await?,
        Command::AddAccounts { file_path, line_format } => {
            pool.load_from_file(&file_path, &line_format).await?;
        }
        Command::DelAccounts { usernames } => pool.delete_accounts(&usernames).await?,
        Command::LoginAccounts { email_first, manual } => {
            let pool = pool.with_login_config(LoginConfig { email_first, manual });
            let stats = pool.login_all(None).await?;
            println!(
                "total: {} - success: {} - failed: {}",
                stats.total, stats.success, stats.failed
            );
        }
        Command::Relogin { usernames, email_first } => {
            let pool = pool.with_login_config(LoginConfig { email_first, manual: false });
            pool.relogin(&usernames).await?;
        }
        Command::ReloginFailed { email_first } => {
            let pool = pool.with_login_config(LoginConfig { email_first, manual: false });
            pool.relogin_failed().await?;
        }
        Command::ResetLocks => pool.reset_locks().await?,
        Command::DeleteInactive => {
            pool.delete_inactive().await?;
        }

        Command::Search { query, limit, .. } => print_stream(api.search(&query, limit)).await?,
        Command::TweetDetails { tweet_id, .. } => print_one(api.tweet_details(tweet_id).await?),
        Command::TweetReplies { tweet_id, limit, .. } => {
            print_stream(api.tweet_replies(tweet_id, limit)).await?
        }
        Command::Retweeters { tweet_id, limit, .. } => {
            print_stream(api.retweeters(tweet_id, limit)).await?
        }
        Command::Favoriters { tweet_id, limit, .. } => {
            print_stream(api.favoriters(tweet_id, limit)).await?
        }
        Command::UserById { user_id, .. } => print_one(api.user_by_id(user_id).await?),
        Command::UserByLogin { username, .. } => print_one(api.user_by_login(&username).await?),
        Command::Followers { user_id, limit, .. } => {
            print_stream(api.followers(user_id, limit)).await?
        }
        Command::Following { user_id, limit, .. } => {
            print_stream(api.following(user_id, limit)).await?
        }
        Command::UserTweets { user_id, limit, .. } => {
            print_stream(api.user_tweets(user_id, limit)).await?
        }
        Command::UserTweetsAndReplies { user_id, limit, .. } => {
            print_stream(api.user_tweets_and_replies(user_id, limit)).await?
        }
        Command::ListTimeline { list_id, limit, .. } => {
            print_stream(api.list_timeline(list_id, limit)).await?
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let env = env_logger::Env::default().filter_or("TWS_LOG_LEVEL", default_level);
    env_logger::Builder::from_env(env).init();

    if let Err(e) = run(cli).await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

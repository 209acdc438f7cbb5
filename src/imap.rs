//! Email confirmation-code fetcher.
//!
//! The login flow's ACID challenge mails a short code to the account's
//! mailbox. This module polls the inbox over IMAP4-SSL until a matching
//! message arrives, bounded by a deadline and by a minimum message time so
//! codes queued before the login attempt are never consumed.

use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use mailparse::MailHeaderMap;
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::util::env_int;

const DEFAULT_WAIT_SECS: i64 = 30;
const POLL_SECS: u64 = 5;

const SENDERS: &[&str] = &["info@x.com", "info@twitter.com"];
const SUBJECT_MARKER: &str = "confirmation code";

/// Known providers whose IMAP host does not follow the `imap.<domain>`
/// convention.
fn imap_host(email: &str) -> Result<String> {
    let domain = email
        .split('@')
        .nth(1)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| Error::EmailCode(format!("invalid email address: {email}")))?;

    Ok(match domain.to_lowercase().as_str() {
        "yahoo.com" => "imap.mail.yahoo.com".to_string(),
        "icloud.com" => "imap.mail.me.com".to_string(),
        "outlook.com" | "hotmail.com" => "imap-mail.outlook.com".to_string(),
        d => format!("imap.{d}"),
    })
}

fn wait_secs() -> i64 {
    env_int("TWS_WAIT_EMAIL_CODE")
        .or_else(|| env_int("LOGIN_CODE_TIMEOUT"))
        .unwrap_or(DEFAULT_WAIT_SECS)
}

/// The code is the last whitespace-delimited token of the subject,
/// e.g. "Your Twitter confirmation code is 123456".
fn code_from_subject(subject: &str) -> Option<String> {
    subject.split_whitespace().last().map(str::to_string)
}

fn message_matches(from: &str, subject: &str) -> bool {
    SENDERS.iter().any(|s| from.contains(s)) && subject.contains(SUBJECT_MARKER)
}

pub struct EmailSession {
    email: String,
    session: async_imap::Session<async_native_tls::TlsStream<TcpStream>>,
}

/// Opens an IMAP4-SSL session for the given mailbox.
pub async fn login(email: &str, password: &str) -> Result<EmailSession> {
    let host = imap_host(email)?;
    let tcp = TcpStream::connect((host.as_str(), 993)).await?;
    let tls = async_native_tls::TlsConnector::new();
    let stream = tls
        .connect(host.as_str(), tcp)
        .await
        .map_err(|e| Error::Imap(e.to_string()))?;

    let client = async_imap::Client::new(stream);
    let session = client
        .login(email, password)
        .await
        .map_err(|(e, _)| Error::Imap(e.to_string()))?;

    Ok(EmailSession { email: email.to_string(), session })
}

impl EmailSession {
    /// Polls the inbox until a confirmation-code message newer than `min_t`
    /// shows up, or the deadline (`TWS_WAIT_EMAIL_CODE`, default 30 s)
    /// passes.
    pub async fn wait_for_code(&mut self, min_t: Option<DateTime<Utc>>) -> Result<String> {
        let deadline = wait_secs();
        let start = std::time::Instant::now();
        let mut was_count = 0u32;

        loop {
            // read-only select: never mark anything as seen
            let mailbox = self.session.examine("INBOX").await?;
            let count = mailbox.exists;

            if count > was_count {
                if let Some(code) = self.scan(count, min_t).await? {
                    return Ok(code);
                }
            }
            was_count = count;

            log::debug!(
                "waiting for confirmation code for {}, msg_count: {count}",
                self.email
            );
            if start.elapsed().as_secs() as i64 > deadline {
                return Err(Error::EmailCode(format!(
                    "timeout on getting confirmation code for {}",
                    self.email
                )));
            }
            tokio::time::sleep(std::time::Duration::from_secs(POLL_SECS)).await;
        }
    }

    /// Scans messages newest-to-oldest. Stops at the first message older
    /// than `min_t`: everything below it is older still.
    async fn scan(&mut self, count: u32, min_t: Option<DateTime<Utc>>) -> Result<Option<String>> {
        for i in (1..=count).rev() {
            let fetches: Vec<async_imap::types::Fetch> = {
                let stream = self.session.fetch(i.to_string(), "RFC822").await?;
                stream.try_collect().await?
            };

            for msg in &fetches {
                let Some(body) = msg.body() else { continue };
                let parsed = mailparse::parse_mail(body)
                    .map_err(|e| Error::EmailCode(e.to_string()))?;

                let headers = parsed.get_headers();
                let date = headers.get_first_value("Date").unwrap_or_default();
                let from = headers.get_first_value("From").unwrap_or_default().to_lowercase();
                let subject = headers
                    .get_first_value("Subject")
                    .unwrap_or_default()
                    .to_lowercase();

                log::debug!("({i} of {count}) {from} - {date} - {subject}");

                let msg_time = mailparse::dateparse(&date)
                    .ok()
                    .and_then(|ts| Utc.timestamp_opt(ts, 0).single());
                if let (Some(min_t), Some(t)) = (min_t, msg_time) {
                    if t < min_t {
                        return Ok(None);
                    }
                }

                if message_matches(&from, &subject) {
                    if let Some(code) = code_from_subject(&subject) {
                        return Ok(Some(code));
                    }
                }
            }
        }
        Ok(None)
    }

    pub async fn logout(mut self) -> Result<()> {
        self.session.logout().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_override_table() {
        assert_eq!(imap_host("a@yahoo.com").unwrap(), "imap.mail.yahoo.com");
        assert_eq!(imap_host("a@icloud.com").unwrap(), "imap.mail.me.com");
        assert_eq!(imap_host("a@outlook.com").unwrap(), "imap-mail.outlook.com");
        assert_eq!(imap_host("a@hotmail.com").unwrap(), "imap-mail.outlook.com");
        assert_eq!(imap_host("a@example.org").unwrap(), "imap.example.org");
        assert!(imap_host("not-an-email").is_err());
    }

    #[test]
    fn code_extraction() {
        let subj = "your x confirmation code is 4t0k3n";
        assert!(message_matches("info@x.com <info@x.com>", subj));
        assert_eq!(code_from_subject(subj).as_deref(), Some("4t0k3n"));

        assert!(!message_matches("spam@example.com", subj));
        assert!(!message_matches("info@x.com", "welcome to x"));
    }
}

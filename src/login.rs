//! Interactive login flow.
//!
//! The remote drives login as a task graph: every response carries a
//! `flow_token` and a list of subtasks, and the client answers the first
//! subtask it knows how to handle until the graph runs dry. On success the
//! authenticated headers and cookies are snapshotted into the account
//! record.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};
use url::Url;

use crate::account::{Account, API_ORIGIN};
use crate::error::{Error, Result};
use crate::imap::{self, EmailSession};
use crate::ops::{BEARER_TOKEN, GUEST_ACTIVATE_URL, LOGIN_URL};
use crate::util::{parse_cookies, utc_now};

#[derive(Clone, Debug, Default)]
pub struct LoginConfig {
    /// Open the IMAP session before starting the flow (some providers are
    /// slow to accept logins mid-flow).
    pub email_first: bool,
    /// Ask the operator for the email code on stdin instead of IMAP.
    pub manual: bool,
}

/// Subtask kinds this client can answer.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Step {
    Instrumentation,
    EnterUsername,
    AlternateIdentifier,
    EnterPassword,
    TwoFactor,
    DuplicationCheck,
    AcidCode,
    AcidEmail,
    Success,
}

/// Picks the first answerable subtask, in the remote's emitted order.
fn pick_step(subtasks: &[Value]) -> Option<(String, Step)> {
    for task in subtasks {
        let Some(id) = task.get("subtask_id").and_then(Value::as_str) else { continue };
        let step = match id {
            "LoginSuccessSubtask" => Some(Step::Success),
            "LoginAcid" => {
                let hint = task
                    .pointer("/enter_text/hint_text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if hint.eq_ignore_ascii_case("confirmation code") {
                    Some(Step::AcidCode)
                } else {
                    Some(Step::AcidEmail)
                }
            }
            "AccountDuplicationCheck" => Some(Step::DuplicationCheck),
            "LoginEnterPassword" => Some(Step::EnterPassword),
            "LoginTwoFactorAuthChallenge" => Some(Step::TwoFactor),
            "LoginEnterUserIdentifierSSO" => Some(Step::EnterUsername),
            "LoginJsInstrumentationSubtask" => Some(Step::Instrumentation),
            "LoginEnterAlternateIdentifierSubtask" => Some(Step::AlternateIdentifier),
            _ => None,
        };
        if let Some(step) = step {
            return Some((id.to_string(), step));
        }
    }
    None
}

fn init_payload() -> Value {
    json!({
        "input_flow_data": {
            "flow_context": {
                "debug_overrides": {},
                "start_location": { "location": "unknown" }
            }
        },
        "subtask_versions": {}
    })
}

fn enter_text_payload(flow_token: &str, subtask_id: &str, text: &str) -> Value {
    json!({
        "flow_token": flow_token,
        "subtask_inputs": [{
            "subtask_id": subtask_id,
            "enter_text": { "text": text, "link": "next_link" }
        }]
    })
}

fn instrumentation_payload(flow_token: &str) -> Value {
    json!({
        "flow_token": flow_token,
        "subtask_inputs": [{
            "subtask_id": "LoginJsInstrumentationSubtask",
            "js_instrumentation": { "response": "{}", "link": "next_link" }
        }]
    })
}

fn username_payload(flow_token: &str, username: &str) -> Value {
    json!({
        "flow_token": flow_token,
        "subtask_inputs": [{
            "subtask_id": "LoginEnterUserIdentifierSSO",
            "settings_list": {
                "setting_responses": [{
                    "key": "user_identifier",
                    "response_data": { "text_data": { "result": username } }
                }],
                "link": "next_link"
            }
        }]
    })
}

fn password_payload(flow_token: &str, password: &str) -> Value {
    json!({
        "flow_token": flow_token,
        "subtask_inputs": [{
            "subtask_id": "LoginEnterPassword",
            "enter_password": { "password": password, "link": "next_link" }
        }]
    })
}

fn duplication_payload(flow_token: &str) -> Value {
    json!({
        "flow_token": flow_token,
        "subtask_inputs": [{
            "subtask_id": "AccountDuplicationCheck",
            "check_logged_in_account": { "link": "AccountDuplicationCheck_false" }
        }]
    })
}

fn success_payload(flow_token: &str) -> Value {
    json!({ "flow_token": flow_token, "subtask_inputs": [] })
}

fn totp_code(account: &Account) -> Result<String> {
    let seed = account
        .mfa_code
        .clone()
        .ok_or_else(|| Error::Login("mfa secret required for two-factor challenge".into()))?;

    let secret = totp_rs::Secret::Encoded(seed)
        .to_bytes()
        .map_err(|e| Error::Login(format!("bad mfa secret: {e:?}")))?;
    let totp = totp_rs::TOTP::new_unchecked(totp_rs::Algorithm::SHA1, 6, 1, 30, secret);
    totp.generate_current()
        .map_err(|e| Error::Login(format!("totp clock error: {e}")))
}

fn prompt_for_code(username: &str, email: &str) -> Result<String> {
    println!("Enter email code for {username} / {email}");
    let mut buf = String::new();
    std::io::stdin().read_line(&mut buf)?;
    Ok(buf.trim().to_string())
}

fn jar_cookies(jar: &Jar) -> HashMap<String, String> {
    let origin: Url = API_ORIGIN.parse().expect("static origin url");
    jar.cookies(&origin)
        .and_then(|v| v.to_str().ok().map(str::to_string))
        .and_then(|s| parse_cookies(&s).ok())
        .unwrap_or_default()
}

struct Flow<'a> {
    account: &'a mut Account,
    cfg: &'a LoginConfig,
    client: reqwest::Client,
    jar: Arc<Jar>,
    headers: HeaderMap,
    imap: Option<EmailSession>,
}

impl Flow<'_> {
    async fn post(&self, url: &str, query: &[(&str, &str)], payload: &Value) -> Result<Value> {
        let rep = self
            .client
            .post(url)
            .headers(self.headers.clone())
            .query(query)
            .json(payload)
            .send()
            .await?;

        let status = rep.status();
        if !status.is_success() {
            let text = rep.text().await.unwrap_or_default();
            return Err(Error::Login(format!("login request failed ({status}): {text}")));
        }
        Ok(rep.json().await?)
    }

    /// After every response: once a `ct0` cookie exists the flow switches
    /// to csrf + authenticated auth-type headers.
    fn sync_session_headers(&mut self) {
        if let Some(ct0) = jar_cookies(&self.jar).get("ct0") {
            if let Ok(v) = HeaderValue::from_str(ct0) {
                self.headers.insert(HeaderName::from_static("x-csrf-token"), v);
                self.headers.insert(
                    HeaderName::from_static("x-twitter-auth-type"),
                    HeaderValue::from_static("OAuth2Session"),
                );
            }
        }
    }

    async fn email_code(&mut self) -> Result<String> {
        if self.cfg.manual {
            return prompt_for_code(&self.account.username, &self.account.email);
        }

        if self.imap.is_none() {
            self.imap =
                Some(imap::login(&self.account.email, &self.account.email_password).await?);
        }

        let min_t = utc_now() - Duration::seconds(30);
        match self.imap.as_mut() {
            Some(session) => session.wait_for_code(Some(min_t)).await,
            None => Err(Error::EmailCode("imap session unavailable".into())),
        }
    }

    /// Runs one subtask round. Returns the next response, or `None` when
    /// the graph emitted nothing this client knows how to answer (flow
    /// complete).
    async fn next_task(&mut self, prev: &Value) -> Result<Option<Value>> {
        self.sync_session_headers();

        let flow_token = prev
            .get("flow_token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Login(format!("flow_token not in {prev}")))?
            .to_string();

        let subtasks = prev.get("subtasks").and_then(Value::as_array);
        let Some((task_id, step)) = subtasks.and_then(|s| pick_step(s)) else {
            return Ok(None);
        };

        let res = self.run_step(&flow_token, &step).await;
        match res {
            Ok(rep) => Ok(Some(rep)),
            Err(e) => {
                self.account.error_msg = Some(format!("login_step={task_id} err={e}"));
                Err(e)
            }
        }
    }

    async fn run_step(&mut self, flow_token: &str, step: &Step) -> Result<Value> {
        let payload = match step {
            Step::Instrumentation => instrumentation_payload(flow_token),
            Step::EnterUsername => username_payload(flow_token, &self.account.username),
            Step::AlternateIdentifier => enter_text_payload(
                flow_token,
                "LoginEnterAlternateIdentifierSubtask",
                &self.account.username,
            ),
            Step::EnterPassword => password_payload(flow_token, &self.account.password),
            Step::TwoFactor => enter_text_payload(
                flow_token,
                "LoginTwoFactorAuthChallenge",
                &totp_code(self.account)?,
            ),
            Step::DuplicationCheck => duplication_payload(flow_token),
            Step::AcidEmail => enter_text_payload(flow_token, "LoginAcid", &self.account.email),
            Step::AcidCode => {
                let code = self.email_code().await?;
                enter_text_payload(flow_token, "LoginAcid", &code)
            }
            Step::Success => success_payload(flow_token),
        };

        self.post(LOGIN_URL, &[], &payload).await
    }
}

async fn get_guest_token(client: &reqwest::Client) -> Result<String> {
    let rep = client
        .post(GUEST_ACTIVATE_URL)
        .send()
        .await?
        .error_for_status()?;
    let body: Value = rep.json().await?;
    body.get("guest_token")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Login("guest token missing in activate response".into()))
}

/// Drives the whole flow for one account; on success the account holds an
/// authenticated session and is active. The caller persists it.
pub async fn login(account: &mut Account, cfg: &LoginConfig) -> Result<()> {
    if account.active {
        log::info!("account already active {} - {}", account.username, account.email);
        return Ok(());
    }

    let imap = if cfg.email_first && !cfg.manual {
        Some(imap::login(&account.email, &account.email_password).await?)
    } else {
        None
    };

    let (client, jar) = account.client_with_jar(None)?;

    let guest_token = get_guest_token(&client).await?;
    let mut headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(&guest_token) {
        headers.insert(HeaderName::from_static("x-guest-token"), v);
    }

    let mut flow = Flow { account, cfg, client, jar, headers, imap };

    let mut rep = flow
        .post(LOGIN_URL, &[("flow_name", "login")], &init_payload())
        .await?;
    while let Some(next) = flow.next_task(&rep).await? {
        rep = next;
    }

    let jar = flow.jar.clone();
    drop(flow);

    let cookies = jar_cookies(&jar);
    if !cookies.contains_key("ct0") {
        return Err(Error::Login("ct0 not in cookies (most likely ip ban)".into()));
    }

    let mut session_headers: HashMap<String, String> = HashMap::from([
        ("user-agent".into(), account.user_agent.clone()),
        ("content-type".into(), "application/json".into()),
        ("authorization".into(), BEARER_TOKEN.into()),
        ("x-twitter-active-user".into(), "yes".into()),
        ("x-twitter-client-language".into(), "en".into()),
        ("x-twitter-auth-type".into(), "OAuth2Session".into()),
    ]);
    if let Some(ct0) = cookies.get("ct0") {
        session_headers.insert("x-csrf-token".into(), ct0.clone());
    }

    account.active = true;
    account.error_msg = None;
    account.headers = session_headers;
    account.cookies = cookies;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Value {
        json!({ "subtask_id": id })
    }

    #[test]
    fn picks_first_known_subtask() {
        let subtasks = vec![task("SomethingNew"), task("LoginEnterPassword"), task("LoginSuccessSubtask")];
        let (id, step) = pick_step(&subtasks).unwrap();
        assert_eq!(id, "LoginEnterPassword");
        assert_eq!(step, Step::EnterPassword);

        assert_eq!(pick_step(&[task("TotallyUnknown")]), None);
        assert_eq!(pick_step(&[]), None);
    }

    #[test]
    fn acid_dispatches_on_hint_text() {
        let code_task = json!({
            "subtask_id": "LoginAcid",
            "enter_text": { "hint_text": "Confirmation Code" }
        });
        assert_eq!(pick_step(&[code_task]).unwrap().1, Step::AcidCode);

        let email_task = json!({
            "subtask_id": "LoginAcid",
            "enter_text": { "hint_text": "Email address" }
        });
        assert_eq!(pick_step(&[email_task]).unwrap().1, Step::AcidEmail);
    }

    #[test]
    fn payloads_carry_flow_token_and_subtask_id() {
        let p = username_payload("tok-1", "user1");
        assert_eq!(p["flow_token"], "tok-1");
        assert_eq!(p["subtask_inputs"][0]["subtask_id"], "LoginEnterUserIdentifierSSO");
        assert_eq!(
            p["subtask_inputs"][0]["settings_list"]["setting_responses"][0]["response_data"]
                ["text_data"]["result"],
            "user1"
        );

        let p = password_payload("tok-2", "s3cret");
        assert_eq!(p["subtask_inputs"][0]["enter_password"]["password"], "s3cret");

        let p = instrumentation_payload("tok-3");
        assert_eq!(p["subtask_inputs"][0]["js_instrumentation"]["response"], "{}");

        let p = duplication_payload("tok-4");
        assert_eq!(
            p["subtask_inputs"][0]["check_logged_in_account"]["link"],
            "AccountDuplicationCheck_false"
        );

        let p = success_payload("tok-5");
        assert_eq!(p["subtask_inputs"].as_array().unwrap().len(), 0);

        let p = enter_text_payload("tok-6", "LoginAcid", "123456");
        assert_eq!(p["subtask_inputs"][0]["enter_text"]["text"], "123456");
    }
}

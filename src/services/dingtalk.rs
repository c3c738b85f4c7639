use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    config::DingTalkConfig,
    error::{Error, Result},
    models::{
        directory::{Department, DirectoryUser, GuardianRelation, Page},
        notification::ActionCard,
    },
    services::{directory::DirectoryClient, notifications::Notifier},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(500);
/// Cached tokens are dropped this long before DingTalk expires them.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

/// QPS limit and "system busy".
const RATE_LIMIT_CODES: [i64; 2] = [88, -1];
/// Access token invalid or expired.
const STALE_TOKEN_CODES: [i64; 2] = [40014, 42001];

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// DingTalk open API: directory lookups and work notifications.
pub struct DingTalkClient {
    http: Client,
    config: DingTalkConfig,
    token: Mutex<Option<CachedToken>>,
}

impl DingTalkClient {
    pub fn new(config: DingTalkConfig) -> Result<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, config, token: Mutex::new(None) })
    }

    pub fn is_configured(&self) -> bool {
        !self.config.app_key.is_empty() && !self.config.app_secret.is_empty()
    }

    async fn call(&self, method: Method, path: &str, query: &[(&str, &str)], body: Option<&Value>) -> Result<Value> {
        if !self.is_configured() {
            return Err(Error::Config("DingTalk credentials are not configured".into()));
        }
        let mut last = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = RETRY_BASE * 2u32.pow(attempt - 1);
                debug!("dingtalk {path}: retry {attempt} in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            match self.call_once(method.clone(), path, query, body).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => {
                    warn!("dingtalk {path}: attempt {} failed: {e}", attempt + 1);
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Upstream {
            code: -1,
            message: format!(
                "{path} failed after {MAX_ATTEMPTS} attempts: {}",
                last.map(|e| e.to_string()).unwrap_or_default()
            ),
        })
    }

    async fn call_once(&self, method: Method, path: &str, query: &[(&str, &str)], body: Option<&Value>) -> Result<Value> {
        let token = self.access_token().await?;
        let url = format!("{}/{}", self.config.api_base, path.trim_start_matches('/'));
        let mut req = self
            .http
            .request(method, url)
            .query(&[("access_token", token.as_str())])
            .query(query);
        if let Some(body) = body {
            req = req.json(body);
        }

        let value = self.read(req.send().await?).await?;
        match check_envelope(&value) {
            Err(Error::Upstream { code, message }) if STALE_TOKEN_CODES.contains(&code) => {
                self.forget_token();
                Err(Error::Transient(format!("access token rejected ({code}: {message})")))
            }
            other => other.map(|()| value),
        }
    }

    async fn read(&self, resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(Error::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Upstream { code: i64::from(status.as_u16()), message: text });
        }
        Ok(resp.json::<Value>().await?)
    }

    async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let url = format!("{}/gettoken", self.config.api_base);
        let resp = self
            .http
            .get(url)
            .query(&[("appkey", &self.config.app_key), ("appsecret", &self.config.app_secret)])
            .send()
            .await?;
        let value = self.read(resp).await?;
        check_envelope(&value)?;
        let parsed: TokenResponse = serde_json::from_value(value)
            .map_err(|e| Error::Upstream { code: 0, message: format!("bad token response: {e}") })?;

        let expires_at = token_deadline(Instant::now(), parsed.expires_in);
        let mut slot = self.token.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(CachedToken { value: parsed.access_token.clone(), expires_at });
        debug!("dingtalk access token refreshed");
        Ok(parsed.access_token)
    }

    fn cached_token(&self) -> Option<String> {
        let slot = self.token.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .filter(|t| Instant::now() < t.expires_at)
            .map(|t| t.value.clone())
    }

    fn forget_token(&self) {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[async_trait]
impl DirectoryClient for DingTalkClient {
    async fn list_child_departments(
        &self,
        parent: Option<i64>,
        page_no: u32,
        page_size: u32,
    ) -> Result<Page<Department>> {
        let mut body = json!({ "page_no": page_no, "page_size": page_size });
        if let Some(parent) = parent {
            body["super_id"] = json!(parent);
        }
        let value = self.call(Method::POST, "topapi/edu/dept/list", &[], Some(&body)).await?;
        parse_departments(value)
    }

    async fn list_class_relations(
        &self,
        class_id: i64,
        page_no: u32,
        page_size: u32,
    ) -> Result<Page<GuardianRelation>> {
        let body = json!({ "class_id": class_id, "page_no": page_no, "page_size": page_size });
        let value = self.call(Method::POST, "topapi/edu/user/relation/list", &[], Some(&body)).await?;
        parse_relations(value)
    }

    async fn resolve_user_by_auth_code(&self, code: &str) -> Result<DirectoryUser> {
        let value = self.call(Method::GET, "user/getuserinfo", &[("code", code)], None).await?;
        let info: UserInfoResponse = decode(value)?;
        Ok(DirectoryUser { external_id: info.userid })
    }
}

#[async_trait]
impl Notifier for DingTalkClient {
    async fn send(&self, recipients: &[String], card: &ActionCard) -> Result<()> {
        if recipients.is_empty() {
            return Ok(());
        }
        let body = json!({
            "agent_id": self.config.agent_id,
            "userid_list": recipients.join(","),
            "msg": {
                "msgtype": "action_card",
                "action_card": {
                    "title": card.title,
                    "markdown": card.markdown_body,
                    "single_title": card.link_label,
                    "single_url": card.link_href,
                }
            }
        });
        self.call(
            Method::POST,
            "topapi/message/corpconversation/asyncsend_v2",
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    7200
}

#[derive(Deserialize)]
struct UserInfoResponse {
    userid: String,
}

#[derive(Deserialize, Default)]
struct DeptListResult {
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    details: Vec<DeptDetail>,
}

#[derive(Deserialize)]
struct DeptDetail {
    dept_id: i64,
    #[serde(default)]
    dept_type: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize, Default)]
struct RelationListResult {
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    relations: Vec<RelationDetail>,
}

#[derive(Deserialize)]
struct RelationDetail {
    from_userid: String,
    to_userid: String,
    #[serde(default)]
    relation_name: String,
}

/// Non-zero `errcode` means failure; rate limits are worth retrying.
fn check_envelope(value: &Value) -> Result<()> {
    let code = value.get("errcode").and_then(Value::as_i64).unwrap_or(0);
    if code == 0 {
        return Ok(());
    }
    let message = value
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if RATE_LIMIT_CODES.contains(&code) {
        Err(Error::Transient(format!("rate limited ({code}: {message})")))
    } else {
        Err(Error::Upstream { code, message })
    }
}

fn token_deadline(now: Instant, expires_in_secs: u64) -> Instant {
    now + Duration::from_secs(expires_in_secs).saturating_sub(TOKEN_MARGIN)
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::Upstream { code: 0, message: format!("unexpected response shape: {e}") })
}

fn result_of<T: for<'de> Deserialize<'de> + Default>(mut value: Value) -> Result<T> {
    match value.get_mut("result").map(Value::take) {
        Some(Value::Null) | None => Ok(T::default()),
        Some(result) => decode(result),
    }
}

fn parse_departments(value: Value) -> Result<Page<Department>> {
    let result: DeptListResult = result_of(value)?;
    Ok(Page {
        items: result
            .details
            .into_iter()
            .map(|d| Department { id: d.dept_id, kind: d.dept_type, name: d.name })
            .collect(),
        has_more: result.has_more,
    })
}

fn parse_relations(value: Value) -> Result<Page<GuardianRelation>> {
    let result: RelationListResult = result_of(value)?;
    Ok(Page {
        items: result
            .relations
            .into_iter()
            .map(|r| GuardianRelation {
                guardian_ext_id: r.from_userid,
                student_ext_id: r.to_userid,
                relation_name: r.relation_name,
            })
            .collect(),
        has_more: result.has_more,
    })
}

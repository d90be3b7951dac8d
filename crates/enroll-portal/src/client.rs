//! Course portal client.
//!
//! Endpoints:
//! - `POST /xsxk/elective/buaa/clazz/list` (JSON) lists teaching classes
//! - `POST /xsxk/elective/buaa/clazz/add` (form) submits a selection
//! - `GET /xsxk/elective/grablessons?batchId=…` is the landing page

use std::time::Duration;

use async_trait::async_trait;
use enroll_core::course::{CourseRecord, SearchResult, SubmitOutcome};
use enroll_core::errors::PortalError;
use enroll_core::portal::{AuthContext, PortalClient};
use enroll_core::token::CapabilityToken;
use enroll_settings::PortalSettings;
use metrics::counter;
use reqwest::header::{AUTHORIZATION, ORIGIN, REFERER};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::envelope;

const LIST_PATH: &str = "/xsxk/elective/buaa/clazz/list";
const ADD_PATH: &str = "/xsxk/elective/buaa/clazz/add";
const LANDING_PATH: &str = "/xsxk/elective/grablessons";

/// reqwest-backed [`PortalClient`].
#[derive(Clone)]
pub struct PortalHttpClient {
    http: reqwest::Client,
    base_url: String,
    class_type: String,
    campus: String,
    page_size: u32,
}

impl PortalHttpClient {
    /// Build a client from portal settings.
    pub fn new(settings: &PortalSettings) -> Result<Self, PortalError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| PortalError::Transport(e.to_string()))?;
        Ok(Self::with_client(http, settings))
    }

    /// Use an existing HTTP client.
    pub fn with_client(http: reqwest::Client, settings: &PortalSettings) -> Self {
        Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_owned(),
            class_type: settings.class_type.clone(),
            campus: settings.campus.clone(),
            page_size: settings.page_size,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn referer(&self, auth: &AuthContext) -> String {
        format!("{}?batchId={}", self.url(LANDING_PATH), auth.batch_id)
    }

    fn list_body(&self, keyword: &str) -> Value {
        let mut body = json!({
            "teachingClassType": self.class_type,
            "pageNumber": 1,
            "pageSize": self.page_size,
            "orderBy": "",
            "campus": self.campus,
            "SFCT": "0",
        });
        if !keyword.is_empty() {
            body["KEY"] = Value::String(keyword.to_owned());
        }
        body
    }

    async fn post_submit(
        &self,
        auth: &AuthContext,
        course_id: &str,
        token: &CapabilityToken,
    ) -> Result<(u16, String), reqwest::Error> {
        let resp = self
            .http
            .post(self.url(ADD_PATH))
            .header(AUTHORIZATION, &auth.bearer)
            .header("batchid", &auth.batch_id)
            .header(ORIGIN, &self.base_url)
            .header(REFERER, self.referer(auth))
            .form(&[
                ("clazzType", self.class_type.as_str()),
                ("clazzId", course_id),
                ("secretVal", token.value()),
            ])
            .send()
            .await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        Ok((status, text))
    }
}

/// Map a submit response to an outcome.
pub(crate) fn submit_outcome(status: u16, body: &str) -> SubmitOutcome {
    if !(200..300).contains(&status) {
        let reason = envelope::status_reason(status, body);
        return if envelope::is_transient_status(status) {
            SubmitOutcome::Transient(reason)
        } else {
            SubmitOutcome::Rejected(reason)
        };
    }
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return SubmitOutcome::Rejected(format!(
            "unexpected response: {}",
            envelope::truncate(body)
        ));
    };
    let message = envelope::message(&parsed).map(str::to_owned);
    if envelope::is_success(&parsed) {
        SubmitOutcome::Accepted(message.unwrap_or_else(|| "选课成功".to_owned()))
    } else {
        SubmitOutcome::Rejected(message.unwrap_or_else(|| envelope::truncate(body)))
    }
}

/// Parse a list response into records.
pub(crate) fn parse_list(body: &str) -> Result<Vec<CourseRecord>, PortalError> {
    let parsed: Value =
        serde_json::from_str(body).map_err(|e| PortalError::Malformed(e.to_string()))?;
    if !envelope::is_success(&parsed) {
        let message = envelope::message(&parsed)
            .map_or_else(|| envelope::truncate(body), str::to_owned);
        return Err(PortalError::Refused(message));
    }
    match &parsed["data"]["rows"] {
        Value::Null => Ok(Vec::new()),
        rows => serde_json::from_value(rows.clone())
            .map_err(|e| PortalError::Malformed(format!("data.rows: {e}"))),
    }
}

fn transport(e: &reqwest::Error) -> PortalError {
    PortalError::Transport(e.to_string())
}

#[async_trait]
impl PortalClient for PortalHttpClient {
    #[instrument(skip(self, auth), fields(principal = %auth.principal))]
    async fn search(&self, auth: &AuthContext, keyword: &str) -> Result<SearchResult, PortalError> {
        let resp = self
            .http
            .post(self.url(LIST_PATH))
            .header(AUTHORIZATION, &auth.bearer)
            .header("batchid", &auth.batch_id)
            .header(ORIGIN, &self.base_url)
            .header(REFERER, self.referer(auth))
            .json(&self.list_body(keyword))
            .send()
            .await
            .map_err(|e| transport(&e))?;

        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| transport(&e))?;
        if !(200..300).contains(&status) {
            return Err(PortalError::Status {
                status,
                message: envelope::status_reason(status, &body),
            });
        }

        let records = parse_list(&body)?;
        debug!(count = records.len(), "course list received");
        Ok(SearchResult {
            records,
            raw_body: body,
        })
    }

    #[instrument(skip(self, auth, token), fields(principal = %auth.principal))]
    async fn submit(
        &self,
        auth: &AuthContext,
        course_id: &str,
        token: &CapabilityToken,
    ) -> SubmitOutcome {
        let outcome = match self.post_submit(auth, course_id, token).await {
            Ok((status, body)) => submit_outcome(status, &body),
            Err(e) => {
                warn!(error = %e, "submit request failed");
                SubmitOutcome::Transient(format!("network error: {e}"))
            }
        };
        let label = match &outcome {
            SubmitOutcome::Accepted(_) => "accepted",
            SubmitOutcome::Rejected(_) => "rejected",
            SubmitOutcome::Transient(_) => "transient",
        };
        counter!("portal_submits_total", "outcome" => label).increment(1);
        outcome
    }

    async fn landing_page(&self, auth: &AuthContext) -> Result<String, PortalError> {
        let resp = self
            .http
            .get(self.url(LANDING_PATH))
            .query(&[("batchId", auth.batch_id.as_str())])
            .header(AUTHORIZATION, &auth.bearer)
            .send()
            .await
            .map_err(|e| transport(&e))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| transport(&e))?;
        if !(200..300).contains(&status) {
            return Err(PortalError::Status {
                status,
                message: envelope::status_reason(status, &body),
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    // ── submit_outcome ──

    #[test]
    fn accepted_uses_portal_message() {
        assert_eq!(
            submit_outcome(200, r#"{"code":200,"msg":"选课成功"}"#),
            SubmitOutcome::Accepted("选课成功".into())
        );
        assert_eq!(
            submit_outcome(200, r#"{"success":true}"#),
            SubmitOutcome::Accepted("选课成功".into())
        );
    }

    #[test]
    fn refusal_is_rejected_with_message() {
        assert_eq!(
            submit_outcome(200, r#"{"code":500,"message":"课容量已满"}"#),
            SubmitOutcome::Rejected("课容量已满".into())
        );
    }

    #[test]
    fn status_mapping() {
        assert_matches!(submit_outcome(503, ""), SubmitOutcome::Transient(r) if r == "HTTP 503 Service Unavailable");
        assert_matches!(submit_outcome(429, "slow down"), SubmitOutcome::Transient(_));
        assert_matches!(submit_outcome(401, "expired"), SubmitOutcome::Rejected(r) if r == "HTTP 401 Unauthorized: expired");
    }

    #[test]
    fn non_json_body_rejected_and_truncated() {
        let body = "<html>".repeat(50);
        assert_matches!(submit_outcome(200, &body), SubmitOutcome::Rejected(r) => {
            assert!(r.starts_with("unexpected response: <html>"));
            assert!(r.chars().count() < 140);
        });
    }

    // ── parse_list ──

    #[test]
    fn list_rows_parsed() {
        let body = r#"{"code":200,"data":{"total":1,"rows":[{"JXBID":"J1","KCM":"编译原理","JSXM":"张","secretVal":"abc"}]}}"#;
        let records = parse_list(body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].class_id, "J1");
        assert_eq!(records[0].secret_val.as_deref(), Some("abc"));
    }

    #[test]
    fn list_refusal_and_garbage() {
        assert_matches!(parse_list(r#"{"code":401,"msg":"认证失败"}"#), Err(PortalError::Refused(m)) if m == "认证失败");
        assert_matches!(parse_list("not json"), Err(PortalError::Malformed(_)));
        assert!(parse_list(r#"{"code":200,"data":{}}"#).unwrap().is_empty());
    }

    #[test]
    fn keyword_omitted_when_empty() {
        let client = PortalHttpClient::with_client(reqwest::Client::new(), &PortalSettings::default());
        assert!(client.list_body("").get("KEY").is_none());
        assert_eq!(client.list_body("编译")["KEY"], "编译");
        assert_eq!(client.list_body("")["teachingClassType"], "FANKC");
    }
}

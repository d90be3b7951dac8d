//! CAS username/password sign-on.
//!
//! The flow mirrors what a browser does:
//!
//! 1. `GET /xsxk/auth/cas`, which redirects to the CAS login form
//! 2. scrape the form's `execution` field
//! 3. post the credentials back to the form URL; on success the portal sets
//!    a `token` cookie after the redirect chain
//! 4. `POST /xsxk/web/studentInfo` with that token to find the active
//!    elective batch
//!
//! Each call uses its own cookie jar so concurrent sign-ons never share
//! state.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use enroll_core::errors::AuthError;
use enroll_core::portal::{AuthContext, AuthProvider, Credentials};
use enroll_settings::PortalSettings;
use metrics::counter;
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Url};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::envelope;

const CAS_ENTRY_PATH: &str = "/xsxk/auth/cas";
const STUDENT_INFO_PATH: &str = "/xsxk/web/studentInfo";
const TOKEN_COOKIE: &str = "token";

static EXECUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"name="execution"\s+value="([^"]+)""#).unwrap());

/// [`AuthProvider`] that signs on through the university CAS.
#[derive(Clone, Debug)]
pub struct CasAuthenticator {
    base_url: String,
    timeout: Duration,
    user_agent: String,
}

impl CasAuthenticator {
    /// Build an authenticator from portal settings.
    pub fn new(settings: &PortalSettings) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_owned(),
            timeout: Duration::from_millis(settings.request_timeout_ms),
            user_agent: settings.user_agent.clone(),
        }
    }

    fn client(&self, jar: Arc<Jar>) -> Result<Client, AuthError> {
        Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .cookie_provider(jar)
            .build()
            .map_err(|e| AuthError::Unavailable(e.to_string()))
    }

    /// Fetch the login form; returns its final URL and the `execution` value.
    async fn login_form(&self, http: &Client) -> Result<(Url, String), AuthError> {
        let resp = http
            .get(format!("{}{CAS_ENTRY_PATH}", self.base_url))
            .send()
            .await
            .map_err(unavailable)?;
        let status = resp.status().as_u16();
        let form_url = resp.url().clone();
        let html = resp.text().await.map_err(unavailable)?;
        check_status(status, &html)?;

        let execution = EXECUTION
            .captures(&html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_owned())
            .ok_or_else(|| AuthError::Rejected("login form has no execution field".into()))?;
        Ok((form_url, execution))
    }

    async fn submit_credentials(
        &self,
        http: &Client,
        jar: &Jar,
        form_url: Url,
        execution: &str,
        credentials: &Credentials,
    ) -> Result<String, AuthError> {
        let resp = http
            .post(form_url)
            .form(&[
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
                ("execution", execution),
                ("submit", "登录"),
                ("type", "username_password"),
                ("_eventId", "submit"),
            ])
            .send()
            .await
            .map_err(unavailable)?;

        let landed = resp.url().clone();
        let from_response = resp
            .cookies()
            .find(|c| c.name() == TOKEN_COOKIE)
            .map(|c| c.value().to_owned());
        let status = resp.status().as_u16();
        if envelope::is_transient_status(status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Unavailable(envelope::status_reason(status, &body)));
        }

        let portal = Url::parse(&self.base_url).map_err(|e| AuthError::Unavailable(e.to_string()))?;
        [&portal, &landed]
            .into_iter()
            .find_map(|url| jar_cookie(jar, url, TOKEN_COOKIE))
            .or(from_response)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::Rejected("no token cookie after login; check credentials".into()))
    }

    async fn active_batch(&self, http: &Client, token: &str) -> Result<String, AuthError> {
        let resp = http
            .post(format!("{}{STUDENT_INFO_PATH}", self.base_url))
            .header(AUTHORIZATION, token)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(unavailable)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(unavailable)?;
        check_status(status, &body)?;

        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| AuthError::Rejected(format!("student info unreadable: {e}")))?;
        batch_code(&parsed).ok_or_else(|| {
            let detail = envelope::message(&parsed).unwrap_or("no elective batch");
            AuthError::Rejected(format!("no active elective batch: {detail}"))
        })
    }
}

fn unavailable(e: reqwest::Error) -> AuthError {
    AuthError::Unavailable(e.to_string())
}

fn check_status(status: u16, body: &str) -> Result<(), AuthError> {
    if (200..300).contains(&status) {
        Ok(())
    } else if envelope::is_transient_status(status) {
        Err(AuthError::Unavailable(envelope::status_reason(status, body)))
    } else {
        Err(AuthError::Rejected(envelope::status_reason(status, body)))
    }
}

/// Read one cookie from the jar's `Cookie` header for `url`.
fn jar_cookie(jar: &Jar, url: &Url, name: &str) -> Option<String> {
    let header = jar.cookies(url)?;
    let header = header.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_owned())
    })
}

/// `data.student.electiveBatchList[0].code`.
fn batch_code(info: &Value) -> Option<String> {
    let code = &info["data"]["student"]["electiveBatchList"][0]["code"];
    match code {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl AuthProvider for CasAuthenticator {
    #[instrument(skip_all, fields(principal = %credentials.username))]
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthContext, AuthError> {
        let jar = Arc::new(Jar::default());
        let http = self.client(Arc::clone(&jar))?;

        let result = async {
            let (form_url, execution) = self.login_form(&http).await?;
            debug!(form = %form_url, "login form fetched");
            let token = self
                .submit_credentials(&http, &jar, form_url, &execution, credentials)
                .await?;
            let batch_id = self.active_batch(&http, &token).await?;
            Ok::<_, AuthError>((token, batch_id))
        }
        .await;

        match result {
            Ok((bearer, batch_id)) => {
                counter!("auth_attempts_total", "outcome" => "success").increment(1);
                info!(batch = %batch_id, "signed on");
                Ok(AuthContext {
                    principal: credentials.username.clone(),
                    bearer,
                    batch_id,
                    issued_at: Utc::now(),
                })
            }
            Err(e) => {
                let label = match e {
                    AuthError::Rejected(_) => "rejected",
                    AuthError::Unavailable(_) => "unavailable",
                };
                counter!("auth_attempts_total", "outcome" => label).increment(1);
                warn!(error = %e, "sign-on failed");
                Err(e)
            }
        }
    }
}

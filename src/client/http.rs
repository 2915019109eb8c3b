//! Reqwest-based collaborators: account directory lookups and webhook delivery.

use crate::client::{AccountDirectory, AccountPlan, Notification, Notifier};
use crate::KeywardenError;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Default request timeout for collaborator calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Account directory backed by an HTTP service.
///
/// Looks plans up at `GET {base}/accounts/{account_id}/plan`; a 404 means
/// the account is unknown.
#[derive(Debug, Clone)]
pub struct HttpAccountDirectory {
    client: Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpAccountDirectory {
    /// Create a directory client for the service at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, KeywardenError> {
        let base_url = Url::parse(base_url).map_err(|e| {
            KeywardenError::ConfigError(format!("Invalid account directory URL: {}", e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(KeywardenError::ConfigError(format!(
                "Account directory URL cannot be a base: {}",
                base_url
            )));
        }

        Ok(Self {
            client: build_client(DEFAULT_TIMEOUT)?,
            base_url,
            bearer_token: None,
        })
    }

    /// Authenticate lookups with a bearer token.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Set request timeout.
    pub fn try_with_timeout(mut self, timeout: Duration) -> Result<Self, KeywardenError> {
        self.client = build_client(timeout)?;
        Ok(self)
    }

    fn plan_url(&self, account_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["accounts", account_id, "plan"]);
        }
        url
    }
}

#[async_trait]
impl AccountDirectory for HttpAccountDirectory {
    async fn current_plan(&self, account_id: &str) -> Result<Option<AccountPlan>, KeywardenError> {
        let url = self.plan_url(account_id);
        let mut request = self
            .client
            .get(url.clone())
            .header(USER_AGENT, user_agent())
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| KeywardenError::Collaborator(format!("Plan lookup failed: {}", e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(account_id, "Account not found in directory");
                Ok(None)
            }
            status if status.is_success() => {
                let plan = response.json::<AccountPlan>().await.map_err(|e| {
                    KeywardenError::Collaborator(format!("Invalid plan response: {}", e))
                })?;
                Ok(Some(plan))
            }
            status => Err(KeywardenError::Collaborator(format!(
                "Plan lookup for {} returned {}",
                account_id, status
            ))),
        }
    }
}

/// Notifier that POSTs each notification as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: Url,
}

impl WebhookNotifier {
    /// Create a notifier for the webhook at `url`.
    pub fn new(url: &str) -> Result<Self, KeywardenError> {
        let url = Url::parse(url)
            .map_err(|e| KeywardenError::ConfigError(format!("Invalid webhook URL: {}", e)))?;
        Ok(Self {
            client: build_client(DEFAULT_TIMEOUT)?,
            url,
        })
    }

    /// Set request timeout.
    pub fn try_with_timeout(mut self, timeout: Duration) -> Result<Self, KeywardenError> {
        self.client = build_client(timeout)?;
        Ok(self)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), KeywardenError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(USER_AGENT, user_agent())
            .json(&notification)
            .send()
            .await
            .map_err(|e| KeywardenError::Collaborator(format!("Webhook delivery failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(KeywardenError::Collaborator(format!(
                "Webhook returned {} for {}",
                status,
                notification.kind()
            )));
        }
        Ok(())
    }
}

fn build_client(timeout: Duration) -> Result<Client, KeywardenError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| KeywardenError::ConfigError(format!("Failed to build HTTP client: {}", e)))
}

/// User-Agent sent on collaborator calls: `keywarden/<version>`.
pub fn user_agent() -> String {
    format!("keywarden/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_user_agent_format() {
        assert_eq!(
            user_agent(),
            format!("keywarden/{}", env!("CARGO_PKG_VERSION"))
        );
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(matches!(
            HttpAccountDirectory::new("not a url"),
            Err(KeywardenError::ConfigError(_))
        ));
        assert!(HttpAccountDirectory::new("mailto:ops@example.com").is_err());
        assert!(WebhookNotifier::new("::").is_err());
    }

    #[test]
    fn test_plan_url_escapes_account_id() {
        let directory = HttpAccountDirectory::new("https://billing.internal/api/").unwrap();
        assert_eq!(
            directory.plan_url("acct 1").as_str(),
            "https://billing.internal/api/accounts/acct%201/plan"
        );
    }

    #[tokio::test]
    async fn test_plan_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/acct-1/plan"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "account_id": "acct-1",
                "plan_name": "growth",
                "monthly_allowance": 25000
            })))
            .mount(&server)
            .await;

        let directory = HttpAccountDirectory::new(&server.uri())
            .unwrap()
            .with_bearer_token("s3cret");
        let plan = directory.current_plan("acct-1").await.unwrap().unwrap();
        assert_eq!(plan.plan_name, "growth");
        assert_eq!(plan.monthly_allowance, 25_000);
    }

    #[tokio::test]
    async fn test_unknown_account_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/ghost/plan"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let directory = HttpAccountDirectory::new(&server.uri()).unwrap();
        assert!(directory.current_plan("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_collaborator_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let directory = HttpAccountDirectory::new(&server.uri()).unwrap();
        assert!(matches!(
            directory.current_plan("acct-1").await,
            Err(KeywardenError::Collaborator(_))
        ));
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/quota"))
            .and(body_partial_json(json!({"type": "quota_warning", "used": 80})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(&format!("{}/hooks/quota", server.uri())).unwrap();
        notifier
            .notify(Notification::QuotaWarning {
                api_key_id: "key-1".to_string(),
                account_id: "acct-1".to_string(),
                month_year: "2025-01".to_string(),
                used: 80,
                quota_limit: 100,
                threshold_percent: 80,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_webhook_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(&server.uri()).unwrap();
        let result = notifier
            .notify(Notification::QuotaExhausted {
                api_key_id: "key-1".to_string(),
                account_id: "acct-1".to_string(),
                month_year: "2025-01".to_string(),
                quota_limit: 100,
            })
            .await;
        assert!(matches!(result, Err(KeywardenError::Collaborator(_))));
    }
}

//! Issue-tracker escalation -- open a Redmine ticket when a script fails.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::TrackerConfig;
use crate::retry::{self, Backoff, Retryable};
use crate::truncate_chars;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("issue tracker is not configured (base_url / api_key missing)")]
    NotConfigured,

    #[error("project '{0}' has no issue-tracker id")]
    MissingProject(String),

    #[error("issue tracker answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("issue tracker unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected issue tracker response: {0}")]
    InvalidResponse(String),
}

impl Retryable for TrackerError {
    fn is_transient(&self) -> bool {
        match self {
            TrackerError::Transport(e) => !e.is_builder(),
            TrackerError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// What to file.
#[derive(Debug, Clone)]
pub struct TicketRequest {
    pub project_external_id: String,
    pub subject: String,
    pub description: String,
    /// Script priority ordinal, 1 (low) to 5 (immediate).
    pub priority: u8,
    pub assignee_id: Option<i64>,
}

#[async_trait]
pub trait TicketIssuer: Send + Sync {
    /// Open a ticket and return its id.
    async fn create_or_escalate(&self, request: &TicketRequest) -> Result<i64, TrackerError>;
}

#[derive(Serialize)]
struct IssueEnvelope<'a> {
    issue: NewIssue<'a>,
}

#[derive(Serialize)]
struct NewIssue<'a> {
    project_id: serde_json::Value,
    subject: &'a str,
    description: &'a str,
    priority_id: u8,
    tracker_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    assigned_to_id: Option<i64>,
}

#[derive(Deserialize)]
struct CreatedEnvelope {
    issue: CreatedIssue,
}

#[derive(Deserialize)]
struct CreatedIssue {
    id: i64,
}

/// Redmine REST client (`POST /issues.json`).
#[derive(Debug, Clone)]
pub struct RedmineClient {
    client: Client,
    base_url: Option<String>,
    api_key: Option<String>,
    tracker_id: i64,
    description_limit: usize,
    backoff: Backoff,
}

impl RedmineClient {
    pub fn new(config: &TrackerConfig) -> Result<Self, TrackerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.as_ref().map(|u| u.trim_end_matches('/').to_string()),
            api_key: config.api_key.clone(),
            tracker_id: config.tracker_id,
            description_limit: config.description_limit,
            backoff: Backoff::new(config.max_attempts, Duration::from_millis(config.backoff_ms)),
        })
    }

    async fn post_issue(&self, url: &str, api_key: &str, body: &IssueEnvelope<'_>) -> Result<i64, TrackerError> {
        let response = self
            .client
            .post(url)
            .header("X-Redmine-API-Key", api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TrackerError::Status {
                status: status.as_u16(),
                body: truncate_chars(&body, 500).to_string(),
            });
        }

        let created: CreatedEnvelope = response
            .json()
            .await
            .map_err(|e| TrackerError::InvalidResponse(e.to_string()))?;
        Ok(created.issue.id)
    }
}

#[async_trait]
impl TicketIssuer for RedmineClient {
    async fn create_or_escalate(&self, request: &TicketRequest) -> Result<i64, TrackerError> {
        let (Some(base_url), Some(api_key)) = (&self.base_url, &self.api_key) else {
            return Err(TrackerError::NotConfigured);
        };
        let url = format!("{base_url}/issues.json");

        // Numeric ids go out as numbers, identifiers as strings.
        let project_id = request
            .project_external_id
            .parse::<i64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::from(request.project_external_id.clone()));

        let body = IssueEnvelope {
            issue: NewIssue {
                project_id,
                subject: &request.subject,
                description: truncate_chars(&request.description, self.description_limit),
                priority_id: request.priority,
                tracker_id: self.tracker_id,
                assigned_to_id: request.assignee_id,
            },
        };

        let id = retry::with_backoff("redmine issue", self.backoff, || {
            self.post_issue(&url, api_key, &body)
        })
        .await?;
        info!(ticket_id = id, project = %request.project_external_id, "tracker ticket created");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct Fake {
        status: StatusCode,
        reply: Value,
        seen: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    }

    async fn issues(State(fake): State<Fake>, headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        let key = headers
            .get("X-Redmine-API-Key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        fake.seen.lock().unwrap().push((key, body));
        (fake.status, Json(fake.reply.clone()))
    }

    async fn spawn_fake(status: StatusCode, reply: Value) -> (String, Arc<Mutex<Vec<(Option<String>, Value)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/issues.json", post(issues))
            .with_state(Fake { status, reply, seen: seen.clone() });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    fn config(base_url: Option<String>) -> TrackerConfig {
        TrackerConfig {
            base_url,
            api_key: Some("secret".into()),
            max_attempts: 3,
            backoff_ms: 1,
            description_limit: 10,
            ..TrackerConfig::default()
        }
    }

    fn request() -> TicketRequest {
        TicketRequest {
            project_external_id: "42".into(),
            subject: "Automated test failure - login".into(),
            description: "0123456789abcdef".into(),
            priority: 4,
            assignee_id: Some(7),
        }
    }

    #[tokio::test]
    async fn test_creates_issue() {
        let (url, seen) = spawn_fake(StatusCode::CREATED, json!({"issue": {"id": 1234}})).await;
        let client = RedmineClient::new(&config(Some(format!("{url}/")))).unwrap();

        let id = client.create_or_escalate(&request()).await.unwrap();
        assert_eq!(id, 1234);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (key, body) = &seen[0];
        assert_eq!(key.as_deref(), Some("secret"));
        assert_eq!(body["issue"]["project_id"], json!(42));
        assert_eq!(body["issue"]["description"], json!("0123456789"));
        assert_eq!(body["issue"]["priority_id"], json!(4));
        assert_eq!(body["issue"]["tracker_id"], json!(2));
        assert_eq!(body["issue"]["assigned_to_id"], json!(7));
    }

    #[tokio::test]
    async fn test_identifier_project_and_no_assignee() {
        let (url, seen) = spawn_fake(StatusCode::CREATED, json!({"issue": {"id": 5}})).await;
        let client = RedmineClient::new(&config(Some(url))).unwrap();
        let mut req = request();
        req.project_external_id = "shop-qa".into();
        req.assignee_id = None;
        client.create_or_escalate(&req).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].1["issue"]["project_id"], json!("shop-qa"));
        assert!(seen[0].1["issue"].get("assigned_to_id").is_none());
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let (url, seen) = spawn_fake(StatusCode::UNPROCESSABLE_ENTITY, json!({"errors": ["Project is invalid"]})).await;
        let client = RedmineClient::new(&config(Some(url))).unwrap();
        let err = client.create_or_escalate(&request()).await.unwrap_err();
        assert!(matches!(err, TrackerError::Status { status: 422, .. }));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let (url, seen) = spawn_fake(StatusCode::SERVICE_UNAVAILABLE, json!({})).await;
        let client = RedmineClient::new(&config(Some(url))).unwrap();
        let err = client.create_or_escalate(&request()).await.unwrap_err();
        assert!(matches!(err, TrackerError::Status { status: 503, .. }));
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_not_configured() {
        let client = RedmineClient::new(&config(None)).unwrap();
        let err = client.create_or_escalate(&request()).await.unwrap_err();
        assert!(matches!(err, TrackerError::NotConfigured));
    }

    #[tokio::test]
    async fn test_unreachable_tracker() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut cfg = config(Some(format!("http://{addr}")));
        cfg.max_attempts = 1;
        let client = RedmineClient::new(&cfg).unwrap();
        let err = client.create_or_escalate(&request()).await.unwrap_err();
        assert!(matches!(err, TrackerError::Transport(_)));
    }
}

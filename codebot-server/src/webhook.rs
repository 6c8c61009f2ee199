use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use codebot_core::naming::{extract_workspace_id, is_automation_branch};
use codebot_core::{ObservedPrState, RepoRef, ReviewEvent, Task};

use crate::gate::Admission;
use crate::github::{InlineComment, IssueComment, Review, User};
use crate::ingest::{inline_event, issue_event, review_event};
use crate::AppState;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";

#[derive(Debug, Deserialize, Clone)]
pub struct Repository {
    pub name: String,
    pub owner: User,
}

impl Repository {
    fn repo_ref(&self) -> RepoRef {
        RepoRef::new(&self.owner.login, &self.name)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestHead {
    #[serde(rename = "ref")]
    pub ref_name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequest {
    pub number: u64,
    pub head: PullRequestHead,
    pub html_url: Option<String>,
    #[serde(default)]
    pub merged: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Issue {
    pub number: u64,
    pub pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ReviewCommentPayload {
    pub action: String,
    pub repository: Repository,
    pub pull_request: PullRequest,
    pub comment: InlineComment,
}

#[derive(Debug, Deserialize)]
pub struct ReviewPayload {
    pub action: String,
    pub repository: Repository,
    pub pull_request: PullRequest,
    pub review: Review,
}

#[derive(Debug, Deserialize)]
pub struct IssueCommentPayload {
    pub action: String,
    pub repository: Repository,
    pub issue: Issue,
    pub comment: IssueComment,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestPayload {
    pub action: String,
    pub repository: Repository,
    pub pull_request: PullRequest,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

impl WebhookResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,
    #[error("malformed signature")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
}

type HmacSha256 = Hmac<Sha256>;

pub fn verify_github_signature(
    secret: &str,
    payload: &[u8],
    signature: Option<&str>,
) -> Result<(), SignatureError> {
    let signature = signature.ok_or(SignatureError::Missing)?;
    let signature_hex = signature
        .strip_prefix("sha256=")
        .ok_or(SignatureError::Malformed)?;
    let signature_bytes = hex::decode(signature_hex).map_err(|_| SignatureError::Malformed)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(payload);

    // Constant-time comparison
    mac.verify_slice(&signature_bytes)
        .map_err(|_| SignatureError::Mismatch)
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(secret) = state.webhook_secret.as_deref() else {
        error!("GITHUB_WEBHOOK_SECRET is not configured, rejecting webhook");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    };

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok());

    if let Err(e) = verify_github_signature(secret, &bytes, signature) {
        warn!("Rejecting webhook: {}", e);
        return Err(StatusCode::UNAUTHORIZED);
    }

    let request = Request::from_parts(parts, axum::body::Body::from(bytes));
    Ok(next.run(request).await)
}

fn parse<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StatusCode> {
    serde_json::from_slice(bytes).map_err(|e| {
        warn!("Unparseable webhook payload: {}", e);
        StatusCode::BAD_REQUEST
    })
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let event_type = headers
        .get(EVENT_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    info!("Received {} webhook", event_type);

    match event_type {
        "pull_request_review_comment" => {
            let payload: ReviewCommentPayload = parse(&body)?;
            if payload.action != "created" {
                return Ok(WebhookResponse::new("Action not handled"));
            }
            let branch = payload.pull_request.head.ref_name.as_str();
            if !is_automation_branch(branch, &state.branch_prefix) {
                debug!("Ignoring comment on non-automation branch {}", branch);
                return Ok(WebhookResponse::new("Not an automation branch"));
            }
            let event = inline_event(
                &payload.repository.repo_ref(),
                payload.pull_request.number,
                Some(branch),
                &payload.comment,
            );
            Ok(submit(&state, event).await)
        }
        "pull_request_review" => {
            let payload: ReviewPayload = parse(&body)?;
            if payload.action != "submitted" {
                return Ok(WebhookResponse::new("Action not handled"));
            }
            let branch = payload.pull_request.head.ref_name.as_str();
            if !is_automation_branch(branch, &state.branch_prefix) {
                debug!("Ignoring review on non-automation branch {}", branch);
                return Ok(WebhookResponse::new("Not an automation branch"));
            }
            match review_event(
                &payload.repository.repo_ref(),
                payload.pull_request.number,
                Some(branch),
                &payload.review,
            ) {
                Some(event) => Ok(submit(&state, event).await),
                None => Ok(WebhookResponse::new("Review has nothing to act on")),
            }
        }
        "issue_comment" => {
            let payload: IssueCommentPayload = parse(&body)?;
            if payload.action != "created" {
                return Ok(WebhookResponse::new("Action not handled"));
            }
            if payload.issue.pull_request.is_none() {
                debug!("Ignoring comment on plain issue #{}", payload.issue.number);
                return Ok(WebhookResponse::new("Not a pull request comment"));
            }
            let event = issue_event(
                &payload.repository.repo_ref(),
                payload.issue.number,
                None,
                &payload.comment,
            );
            Ok(submit(&state, event).await)
        }
        "pull_request" => {
            let payload: PullRequestPayload = parse(&body)?;
            handle_pull_request(&state, payload).await
        }
        _ => Ok(WebhookResponse::new("Event type not handled")),
    }
}

async fn submit(state: &AppState, event: ReviewEvent) -> Json<WebhookResponse> {
    let message = match state.gate.submit(event).await {
        Admission::Enqueued => "Event enqueued",
        Admission::Duplicate => "Event already processed",
        Admission::SelfAuthored => "Ignoring own comment",
        Admission::Failed => "Failed to enqueue event",
    };
    WebhookResponse::new(message)
}

async fn handle_pull_request(
    state: &AppState,
    payload: PullRequestPayload,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let pr = &payload.pull_request;
    let observed = match payload.action.as_str() {
        "closed" => ObservedPrState::Closed { merged: pr.merged },
        "reopened" => ObservedPrState::Open,
        _ => return Ok(WebhookResponse::new("Action not handled")),
    };

    let branch = pr.head.ref_name.as_str();
    if !is_automation_branch(branch, &state.branch_prefix) {
        debug!("Ignoring lifecycle event on non-automation branch {}", branch);
        return Ok(WebhookResponse::new("Not an automation branch"));
    }

    let task = find_task(state, branch, pr.html_url.as_deref())
        .await
        .map_err(|e| {
            error!("Task lookup for {} failed: {}", branch, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    let Some(task) = task else {
        info!(
            "No task for PR #{} in {}/{}",
            pr.number, payload.repository.owner.login, payload.repository.name
        );
        return Ok(WebhookResponse::new("No task for this pull request"));
    };

    let task = state.lifecycle.apply(task, observed).await.map_err(|e| {
        error!("Lifecycle update for PR #{} failed: {}", pr.number, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(WebhookResponse::new(format!(
        "Task {} is {}",
        task.id, task.status
    )))
}

async fn find_task(
    state: &AppState,
    branch: &str,
    html_url: Option<&str>,
) -> Result<Option<Task>, codebot_core::store::StoreError> {
    if let Some(id) = extract_workspace_id(branch, &state.branch_prefix) {
        if let Some(task) = state.store.find_task_by_workspace_id(&id).await? {
            return Ok(Some(task));
        }
    }
    match html_url {
        Some(url) => state.store.find_task_by_pr_url(url).await,
        None => Ok(None),
    }
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}

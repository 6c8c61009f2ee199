//! Review-platform collaborator: the GitHub REST surface the engine relies on.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use codebot_core::cursor::format_since;
use codebot_core::{ObservedPrState, PrId, RepoRef};

const API_ROOT: &str = "https://api.github.com";
const ACCEPT: &str = "application/vnd.github.v3+json";
const PER_PAGE: usize = 100;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
}

/// The subset of a pull request the workers and poller need.
#[derive(Debug, Clone, Deserialize)]
pub struct PrDetails {
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub merged: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub head: Option<PullRequestRef>,
    pub html_url: Option<String>,
}

impl PrDetails {
    pub fn observed_state(&self) -> ObservedPrState {
        ObservedPrState::from_api(&self.state, self.merged)
    }

    pub fn head_ref(&self) -> Option<&str> {
        self.head
            .as_ref()
            .map(|h| h.ref_name.as_str())
            .filter(|r| !r.is_empty())
    }
}

/// A review comment attached to a line of the diff.
#[derive(Debug, Clone, Deserialize)]
pub struct InlineComment {
    pub id: u64,
    pub user: User,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub path: Option<String>,
    pub line: Option<u64>,
    pub diff_hunk: Option<String>,
    pub in_reply_to_id: Option<u64>,
}

/// A PR-level conversation comment.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    pub user: User,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A submitted formal review.
#[derive(Debug, Clone, Deserialize)]
pub struct Review {
    pub id: u64,
    pub user: User,
    pub body: Option<String>,
    pub state: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangedFile {
    pub filename: String,
    pub status: String,
}

/// Render changed files one per line as `<STATUS>    <path>`.
pub fn format_changed_files(files: &[ChangedFile]) -> String {
    files
        .iter()
        .map(|f| {
            let status = match f.status.as_str() {
                "added" => "A",
                "removed" => "D",
                "modified" => "M",
                "renamed" => "R",
                "copied" => "C",
                _ => "M",
            };
            format!("{}    {}", status, f.filename)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Operations the engine needs from the code-review platform.
#[async_trait]
pub trait ReviewPlatform: Send + Sync {
    async fn get_pr_state(&self, pr: &PrId) -> Result<ObservedPrState>;

    async fn get_pr_details(&self, pr: &PrId) -> Result<PrDetails>;

    /// Inline comments, narrowed server-side by `since` when given.
    async fn list_inline_comments(
        &self,
        pr: &PrId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InlineComment>>;

    async fn list_issue_comments(
        &self,
        pr: &PrId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<IssueComment>>;

    /// The reviews endpoint has no `since` filter; callers filter by `submitted_at`.
    async fn list_reviews(&self, pr: &PrId) -> Result<Vec<Review>>;

    async fn list_changed_files(&self, pr: &PrId) -> Result<Vec<ChangedFile>>;

    /// Reply in the thread of an inline comment.
    async fn post_reply(&self, pr: &PrId, comment_id: u64, body: &str) -> Result<()>;

    async fn post_issue_comment(&self, pr: &PrId, body: &str) -> Result<()>;

    async fn update_pr_description(&self, pr: &PrId, title: &str, body: &str) -> Result<()>;

    /// Open a PR from `head` against the repository's default branch and
    /// return its html url.
    async fn create_pull_request(
        &self,
        repo: &RepoRef,
        head: &str,
        title: &str,
        body: &str,
    ) -> Result<String>;

    /// Clone URL carrying credentials that allow fetch and push.
    async fn authenticated_clone_url(&self, repo: &RepoRef) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Serialize)]
struct CreateCommentRequest<'a> {
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateReplyRequest<'a> {
    body: &'a str,
    in_reply_to: u64,
}

#[derive(Debug, Serialize)]
struct UpdatePullRequest<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct CreatePullRequest<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
}

#[derive(Debug, Deserialize)]
struct Repository {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct CreatedPullRequest {
    html_url: String,
}

/// GitHub App client acting as a single installation.
#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    app_id: u64,
    installation_id: u64,
    private_key: String,
    token_cache: Arc<RwLock<Option<(String, SystemTime)>>>,
}

impl GitHubClient {
    pub fn new(app_id: u64, installation_id: u64, private_key: String) -> Result<Self> {
        Ok(Self {
            client: create_github_client()?,
            app_id,
            installation_id,
            private_key,
            token_cache: Arc::new(RwLock::new(None)),
        })
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: self.app_id,
            iat: now - 60,  // Issued 60 seconds ago to account for clock skew
            exp: now + 600, // Expires in 10 minutes
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("Failed to parse private key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }

    async fn get_installation_token(&self) -> Result<String> {
        // Reuse the cached token while it has more than 5 minutes left
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.as_ref() {
                if expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .as_secs()
                    > 300
                {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            API_ROOT, self.installation_id
        );

        info!("Requesting new installation access token");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", ACCEPT)
            .send()
            .await
            .context("Failed to send installation token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!(
                "GitHub App token request failed: {} - {}",
                status, error_text
            );
            return Err(anyhow!(
                "GitHub App token request failed: {} - {}",
                status,
                error_text
            ));
        }

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;

        let expires_at = DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);
        let expires_secs = u64::try_from(expires_at.timestamp()).unwrap_or(0);
        let expires_at_system = UNIX_EPOCH + std::time::Duration::from_secs(expires_secs);

        *self.token_cache.write().await = Some((token_response.token.clone(), expires_at_system));

        info!("Successfully obtained installation access token");
        Ok(token_response.token)
    }

    /// Send a request built by `build`, retrying once with a fresh token on 401.
    async fn send_authorized<F>(&self, what: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&str) -> reqwest_middleware::RequestBuilder,
    {
        let token = self.get_installation_token().await?;
        let response = build(&token)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            warn!("Got 401 for {}, retrying with fresh token", what);
            *self.token_cache.write().await = None;
            let fresh_token = self.get_installation_token().await?;
            build(&fresh_token)
                .send()
                .await
                .with_context(|| format!("Failed to send retry {} request", what))?
        } else {
            response
        };

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("GitHub API error ({}): {} - {}", what, status, error_text);
            return Err(anyhow!("GitHub API error: {} - {}", status, error_text));
        }

        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, what: &str, url: &str) -> Result<T> {
        let response = self
            .send_authorized(what, |token| {
                self.client
                    .get(url)
                    .header("Authorization", format!("Bearer {}", token))
                    .header("Accept", ACCEPT)
            })
            .await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }

    /// Follow `page=` until a page comes back shorter than `per_page`.
    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        what: &str,
        base_url: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<T>> {
        let mut all_items = Vec::new();
        let mut page = 1;

        loop {
            let mut url = format!("{}?per_page={}&page={}", base_url, PER_PAGE, page);
            if let Some(since) = since {
                url.push_str("&since=");
                url.push_str(&format_since(since));
            }

            let items: Vec<T> = self.get_json(what, &url).await?;
            let count = items.len();
            all_items.extend(items);

            if count < PER_PAGE {
                break;
            }
            page += 1;
        }

        Ok(all_items)
    }

    async fn send_json<B: Serialize>(
        &self,
        what: &str,
        method: reqwest::Method,
        url: &str,
        body: &B,
    ) -> Result<()> {
        let payload = serde_json::to_string(body)?;
        self.send_authorized(what, |token| {
            self.client
                .request(method.clone(), url)
                .header("Authorization", format!("Bearer {}", token))
                .header("Accept", ACCEPT)
                .header("Content-Type", "application/json")
                .body(payload.clone())
        })
        .await?;
        Ok(())
    }
}

fn pr_url(pr: &PrId, suffix: &str) -> String {
    format!(
        "{}/repos/{}/{}/pulls/{}{}",
        API_ROOT, pr.repo.owner, pr.repo.name, pr.pr_number, suffix
    )
}

fn repo_url(repo: &RepoRef, suffix: &str) -> String {
    format!("{}/repos/{}/{}{}", API_ROOT, repo.owner, repo.name, suffix)
}

fn issue_url(pr: &PrId, suffix: &str) -> String {
    format!(
        "{}/repos/{}/{}/issues/{}{}",
        API_ROOT, pr.repo.owner, pr.repo.name, pr.pr_number, suffix
    )
}

#[async_trait]
impl ReviewPlatform for GitHubClient {
    async fn get_pr_state(&self, pr: &PrId) -> Result<ObservedPrState> {
        Ok(self.get_pr_details(pr).await?.observed_state())
    }

    async fn get_pr_details(&self, pr: &PrId) -> Result<PrDetails> {
        self.get_json("get pull request", &pr_url(pr, "")).await
    }

    async fn list_inline_comments(
        &self,
        pr: &PrId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InlineComment>> {
        self.get_all_pages("list review comments", &pr_url(pr, "/comments"), since)
            .await
    }

    async fn list_issue_comments(
        &self,
        pr: &PrId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<IssueComment>> {
        self.get_all_pages("list issue comments", &issue_url(pr, "/comments"), since)
            .await
    }

    async fn list_reviews(&self, pr: &PrId) -> Result<Vec<Review>> {
        self.get_all_pages("list reviews", &pr_url(pr, "/reviews"), None)
            .await
    }

    async fn list_changed_files(&self, pr: &PrId) -> Result<Vec<ChangedFile>> {
        self.get_all_pages("list PR files", &pr_url(pr, "/files"), None)
            .await
    }

    async fn post_reply(&self, pr: &PrId, comment_id: u64, body: &str) -> Result<()> {
        info!("Replying to review comment {} on {}", comment_id, pr);
        self.send_json(
            "post review comment reply",
            reqwest::Method::POST,
            &pr_url(pr, "/comments"),
            &CreateReplyRequest {
                body,
                in_reply_to: comment_id,
            },
        )
        .await
    }

    async fn post_issue_comment(&self, pr: &PrId, body: &str) -> Result<()> {
        info!("Posting comment to {}", pr);
        self.send_json(
            "post PR comment",
            reqwest::Method::POST,
            &issue_url(pr, "/comments"),
            &CreateCommentRequest { body },
        )
        .await
    }

    async fn update_pr_description(&self, pr: &PrId, title: &str, body: &str) -> Result<()> {
        info!("Updating description of {}", pr);
        self.send_json(
            "update pull request",
            reqwest::Method::PATCH,
            &pr_url(pr, ""),
            &UpdatePullRequest { title, body },
        )
        .await
    }

    async fn create_pull_request(
        &self,
        repo: &RepoRef,
        head: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        let repository: Repository = self.get_json("get repository", &repo_url(repo, "")).await?;
        info!("Opening PR {} -> {} on {}", head, repository.default_branch, repo);

        let payload = serde_json::to_string(&CreatePullRequest {
            title,
            body,
            head,
            base: &repository.default_branch,
        })?;
        let url = repo_url(repo, "/pulls");
        let response = self
            .send_authorized("create pull request", |token| {
                self.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", token))
                    .header("Accept", ACCEPT)
                    .header("Content-Type", "application/json")
                    .body(payload.clone())
            })
            .await?;
        let created: CreatedPullRequest = response
            .json()
            .await
            .context("Failed to parse create pull request response")?;
        Ok(created.html_url)
    }

    async fn authenticated_clone_url(&self, repo: &RepoRef) -> Result<String> {
        let token = self.get_installation_token().await?;
        Ok(format!(
            "https://x-access-token:{}@github.com/{}/{}.git",
            token, repo.owner, repo.name
        ))
    }
}

pub fn create_github_client() -> Result<ClientWithMiddleware> {
    use reqwest_middleware::ClientBuilder;

    let client = Client::builder()
        .user_agent(concat!("codebot/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")?;

    Ok(ClientBuilder::new(client).build())
}

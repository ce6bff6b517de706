use std::time::Duration;

use async_trait::async_trait;
use repodb_types::ObjectId;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RemoteError, RemoteResult};
use crate::object::{Commit, DirEntry, EntryKind, TreeUpdate};
use crate::traits::RemoteStore;

const JSON_ACCEPT: &str = "application/vnd.github+json";
const RAW_ACCEPT: &str = "application/vnd.github.raw";
const API_VERSION_HEADER: &str = "x-github-api-version";
const API_VERSION: &str = "2022-11-28";
const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Connection settings for [`GitHubRemote`].
#[derive(Clone)]
pub struct GitHubConfig {
    /// API root, e.g. `https://api.github.com`.
    pub api_url: String,
    pub owner: String,
    pub repo: String,
    pub token: String,
    /// Per-request timeout applied by the HTTP client.
    pub request_timeout: Duration,
}

impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("api_url", &self.api_url)
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("token", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// [`RemoteStore`] backed by the GitHub REST API.
///
/// Writes go through the git data endpoints (`git/blobs`, `git/trees`,
/// `git/commits`, `git/refs`); reads go through `contents`.
pub struct GitHubRemote {
    client: Client,
    base: Url,
    config: GitHubConfig,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ShaRef {
    sha: String,
}

#[derive(Deserialize)]
struct RefResponse {
    object: ShaRef,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
    tree: ShaRef,
    #[serde(default)]
    parents: Vec<ShaRef>,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ContentItem {
    name: String,
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize)]
struct NewBlob<'a> {
    content: &'a str,
    encoding: &'static str,
}

#[derive(Serialize)]
struct NewTreeEntry<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    sha: &'a str,
}

#[derive(Serialize)]
struct NewTree<'a> {
    base_tree: &'a str,
    tree: Vec<NewTreeEntry<'a>>,
}

#[derive(Serialize)]
struct NewCommit<'a> {
    message: &'a str,
    tree: &'a str,
    parents: Vec<&'a str>,
}

#[derive(Serialize)]
struct RefUpdate<'a> {
    sha: &'a str,
    force: bool,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

impl GitHubRemote {
    /// Build a client for `config`. Does not contact the remote.
    pub fn new(config: GitHubConfig) -> RemoteResult<Self> {
        if config.token.is_empty() || config.owner.is_empty() || config.repo.is_empty() {
            return Err(RemoteError::Config(
                "token, owner and repo must all be set".into(),
            ));
        }
        let base = Url::parse(&config.api_url)
            .map_err(|e| RemoteError::Config(format!("invalid api url {}: {e}", config.api_url)))?;
        if base.cannot_be_a_base() {
            return Err(RemoteError::Config(format!("invalid api url {}", config.api_url)));
        }

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| RemoteError::Config("token contains invalid header characters".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_ACCEPT));
        headers.insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));

        let client = Client::builder()
            .user_agent(concat!("repodb/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RemoteError::Config(e.to_string()))?;

        Ok(Self { client, base, config })
    }

    /// `<api>/repos/<owner>/<repo>/<segments...>`, each segment percent-encoded.
    fn repo_url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> RemoteResult<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| RemoteError::Config("api url cannot be a base".into()))?;
            path.pop_if_empty();
            path.extend(["repos", self.config.owner.as_str(), self.config.repo.as_str()]);
            path.extend(segments.into_iter().filter(|s| !s.is_empty()));
        }
        Ok(url)
    }

    fn contents_url(&self, branch: &str, path: &str) -> RemoteResult<Url> {
        let mut url = self.repo_url(std::iter::once("contents").chain(path.split('/')))?;
        url.query_pairs_mut().append_pair("ref", branch);
        Ok(url)
    }

    fn ref_url(&self, endpoint: &str, branch: &str) -> RemoteResult<Url> {
        self.repo_url(["git", endpoint, "heads"].into_iter().chain(branch.split('/')))
    }

    async fn send(&self, request: RequestBuilder, context: &str) -> RemoteResult<Response> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let rate_limited = response
            .headers()
            .get(RATE_LIMIT_REMAINING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "0");
        let body = response.text().await.unwrap_or_default();
        let err = classify_status(status, rate_limited, &error_message(&body), context);
        tracing::debug!(%status, context, error = %err, "remote request failed");
        Err(err)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder, context: &str) -> RemoteResult<T> {
        self.send(request, context)
            .await?
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Malformed(format!("{context}: {e}")))
    }
}

fn parse_sha(sha: &str) -> RemoteResult<ObjectId> {
    ObjectId::from_hex(sha).map_err(|e| RemoteError::Malformed(e.to_string()))
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Malformed(err.to_string())
    } else if err.is_builder() {
        RemoteError::Config(err.to_string())
    } else {
        RemoteError::TransientNetwork(err.to_string())
    }
}

/// Map a non-success HTTP status to the error taxonomy.
fn classify_status(status: StatusCode, rate_limited: bool, message: &str, context: &str) -> RemoteError {
    match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound(context.to_string()),
        StatusCode::CONFLICT => RemoteError::Conflict {
            branch: context.to_string(),
            reason: message.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => RemoteError::TransientNetwork(format!("rate limited: {message}")),
        StatusCode::FORBIDDEN if rate_limited => {
            RemoteError::TransientNetwork(format!("rate limited: {message}"))
        }
        s if s.is_server_error() => RemoteError::TransientNetwork(format!("{s}: {message}")),
        s => RemoteError::Api {
            status: s.as_u16(),
            message: message.to_string(),
        },
    }
}

/// Pull `message` out of a GitHub error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_owned))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn dir_entries(items: Vec<ContentItem>) -> Vec<DirEntry> {
    items
        .into_iter()
        .filter_map(|item| {
            let kind = match item.kind.as_str() {
                "file" => EntryKind::File,
                "dir" => EntryKind::Dir,
                _ => return None,
            };
            Some(DirEntry {
                name: item.name,
                path: item.path,
                kind,
            })
        })
        .collect()
}

#[async_trait]
impl RemoteStore for GitHubRemote {
    async fn branch_head(&self, branch: &str) -> RemoteResult<ObjectId> {
        let url = self.ref_url("ref", branch)?;
        let head: RefResponse = self
            .send_json(self.client.get(url), &format!("branch {branch}"))
            .await?;
        parse_sha(&head.object.sha)
    }

    async fn commit(&self, id: &ObjectId) -> RemoteResult<Commit> {
        let url = self.repo_url(["git", "commits", id.as_str()])?;
        let commit: CommitResponse = self
            .send_json(self.client.get(url), &format!("commit {id}"))
            .await?;
        Ok(Commit {
            id: parse_sha(&commit.sha)?,
            tree: parse_sha(&commit.tree.sha)?,
            parents: commit
                .parents
                .iter()
                .map(|p| parse_sha(&p.sha))
                .collect::<RemoteResult<_>>()?,
            message: commit.message,
        })
    }

    async fn create_blob(&self, content: &[u8]) -> RemoteResult<ObjectId> {
        let text = std::str::from_utf8(content)
            .map_err(|e| RemoteError::Malformed(format!("blob content is not utf-8: {e}")))?;
        let url = self.repo_url(["git", "blobs"])?;
        let body = NewBlob {
            content: text,
            encoding: "utf-8",
        };
        let blob: ShaRef = self
            .send_json(self.client.post(url).json(&body), "create blob")
            .await?;
        parse_sha(&blob.sha)
    }

    async fn create_tree(&self, base: &ObjectId, updates: &[TreeUpdate]) -> RemoteResult<ObjectId> {
        let url = self.repo_url(["git", "trees"])?;
        let body = NewTree {
            base_tree: base.as_str(),
            tree: updates
                .iter()
                .map(|u| NewTreeEntry {
                    path: &u.path,
                    mode: u.mode.as_git_str(),
                    kind: u.mode.git_type(),
                    sha: u.blob.as_str(),
                })
                .collect(),
        };
        let tree: ShaRef = self
            .send_json(self.client.post(url).json(&body), "create tree")
            .await?;
        parse_sha(&tree.sha)
    }

    async fn create_commit(
        &self,
        message: &str,
        tree: &ObjectId,
        parents: &[ObjectId],
    ) -> RemoteResult<ObjectId> {
        let url = self.repo_url(["git", "commits"])?;
        let body = NewCommit {
            message,
            tree: tree.as_str(),
            parents: parents.iter().map(ObjectId::as_str).collect(),
        };
        let commit: ShaRef = self
            .send_json(self.client.post(url).json(&body), "create commit")
            .await?;
        parse_sha(&commit.sha)
    }

    async fn update_branch(&self, branch: &str, commit: &ObjectId) -> RemoteResult<()> {
        let url = self.ref_url("refs", branch)?;
        let body = RefUpdate {
            sha: commit.as_str(),
            force: false,
        };
        let result = self.send(self.client.patch(url).json(&body), branch).await;
        match result {
            Ok(_) => Ok(()),
            // GitHub reports a rejected non-fast-forward as 422.
            Err(RemoteError::Api { status: 422, message }) => Err(RemoteError::Conflict {
                branch: branch.to_string(),
                reason: message,
            }),
            Err(e) => Err(e),
        }
    }

    async fn read_file(&self, branch: &str, path: &str) -> RemoteResult<Vec<u8>> {
        let url = self.contents_url(branch, path)?;
        let request = self.client.get(url).header(ACCEPT, RAW_ACCEPT);
        let response = self.send(request, path).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(bytes.to_vec())
    }

    async fn list_dir(&self, branch: &str, path: &str) -> RemoteResult<Vec<DirEntry>> {
        let url = self.contents_url(branch, path)?;
        let listing: serde_json::Value = self.send_json(self.client.get(url), path).await?;
        if !listing.is_array() {
            return Err(RemoteError::Malformed(format!("{path} is not a directory")));
        }
        let items: Vec<ContentItem> = serde_json::from_value(listing)
            .map_err(|e| RemoteError::Malformed(format!("{path}: {e}")))?;
        Ok(dir_entries(items))
    }
}

use crate::cache::{CacheEntry, ResponseCache};
use crate::model::*;
use anyhow::{anyhow, Context, Result};
use ci_common::http::{is_transient_status, ResponseExt};
use ci_common::secret::Secret;
use reqwest::header::{HeaderMap, HeaderValue, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LINK};
use reqwest::{Response, StatusCode};
use reqwest_retry::SendRetry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

const RETRY_PERIOD: Duration = Duration::from_secs(2);
const MAX_ELAPSED_TIME: Duration = Duration::from_secs(30);
const MAX_RETRY_ATTEMPTS: i32 = 5;

/// Outcome of a conditional GET against a single (non-paginated) resource.
enum FetchOutcome {
    /// Server returned a fresh body; already written back into the cache.
    Fresh(serde_json::Value),
    /// Server said 304; body is whatever was already cached.
    Cached(serde_json::Value),
    /// 404 or 403: the resource does not exist, or we are not authorized
    /// to see it. Treated identically by the core.
    Absent,
}

/// Client for the source-hosting REST API, with an on-disk conditional-GET
/// cache. One instance is constructed at startup and shared (cloned; the
/// cache is behind an `Arc<Mutex<_>>`) by every worker that talks to the
/// hosting service, rather than reached for through a global.
#[derive(Clone)]
pub struct HostingClient {
    http: reqwest::Client,
    base_url: Url,
    token: Secret<String>,
    repo: String,
    cache: Arc<Mutex<ResponseCache>>,
    cache_path: PathBuf,
}

impl HostingClient {
    pub async fn new(base_url: Url, token: Secret<String>, repo: String, cache_path: PathBuf) -> Result<Self> {
        let cache = ResponseCache::load(&cache_path).await?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token,
            repo,
            cache: Arc::new(Mutex::new(cache)),
            cache_path,
        })
    }

    pub async fn flush_cache(&self) -> Result<()> {
        self.cache.lock().await.save(&self.cache_path).await
    }

    fn repo_url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(&format!("repos/{}/{}", self.repo, path))
            .context("building hosting-service URL")
    }

    /// Conditional GET of a single resource, honoring the on-disk cache.
    /// Transient statuses (5xx, 429, timeouts) are retried with backoff;
    /// 404/403 resolve to `Absent` rather than an error, matching the
    /// error-handling contract for "does not exist / not authorized".
    async fn conditional_get(&self, url: Url) -> Result<FetchOutcome> {
        let key = url.to_string();
        let cached = self.cache.lock().await.get(&key);

        let response = self.send_conditional(&url, &cached).await?;

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                let cached = cached.ok_or_else(|| {
                    anyhow!("server returned 304 but we have no cached entry for {}", url)
                })?;
                Ok(FetchOutcome::Cached(cached.body))
            }
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(FetchOutcome::Absent),
            status if status.is_success() => {
                let etag = header_str(response.headers(), ETAG);
                let last_modified = header_str(response.headers(), reqwest::header::LAST_MODIFIED);
                let next_link = next_link_from(response.headers());
                let body: serde_json::Value = response.json().await.context("decoding response body")?;

                self.cache.lock().await.put(
                    key,
                    CacheEntry {
                        etag,
                        last_modified,
                        body: body.clone(),
                        next_link,
                    },
                );

                Ok(FetchOutcome::Fresh(body))
            }
            status => {
                response.error_for_status_with_body().await?;
                Err(anyhow!("hosting service returned unexpected status {} for {}", status, url))
            }
        }
    }

    async fn send_conditional(&self, url: &Url, cached: &Option<CacheEntry>) -> Result<Response> {
        let build = || {
            let mut req = self
                .http
                .get(url.clone())
                .bearer_auth(self.token.expose_ref());
            if let Some(entry) = cached {
                if let Some(etag) = &entry.etag {
                    req = req.header(IF_NONE_MATCH, etag);
                }
                if let Some(last_modified) = &entry.last_modified {
                    req = req.header(IF_MODIFIED_SINCE, last_modified);
                }
            }
            Ok(req)
        };

        reqwest_retry::send_retry_reqwest(
            build,
            RETRY_PERIOD,
            MAX_ELAPSED_TIME,
            MAX_RETRY_ATTEMPTS,
            |result| match result {
                Err(e) => Err(backoff::Error::Transient(anyhow::Error::from(e))),
                Ok(response) if is_transient_status(response.status()) => Err(
                    backoff::Error::Transient(anyhow!("transient status {}", response.status())),
                ),
                Ok(response) => Ok(response),
            },
        )
        .await
    }

    /// Walks a paginated collection resource, following `Link: rel="next"`
    /// until exhausted. Each page is independently conditional-GET'd and
    /// cached; a 304 on a later page still yields that page's cached body,
    /// so the whole tail can be replayed from cache if nothing changed.
    async fn list_paginated(&self, mut url: Url) -> Result<Vec<serde_json::Value>> {
        let mut items = Vec::new();
        loop {
            let key = url.to_string();
            match self.conditional_get(url).await? {
                FetchOutcome::Absent => break,
                FetchOutcome::Fresh(body) | FetchOutcome::Cached(body) => {
                    if let serde_json::Value::Array(mut page) = body {
                        items.append(&mut page);
                    }

                    let next = self
                        .cache
                        .lock()
                        .await
                        .get(&key)
                        .and_then(|entry| entry.next_link);

                    match next {
                        Some(next) => url = Url::parse(&next).context("parsing Link next URL")?,
                        None => break,
                    }
                }
            }
        }
        Ok(items)
    }

    pub async fn list_open_prs(&self, branch: &str) -> Result<Vec<RawPullRequest>> {
        let url = {
            let mut url = self.repo_url("pulls")?;
            url.query_pairs_mut()
                .append_pair("state", "open")
                .append_pair("base", branch)
                .append_pair("per_page", "100");
            url
        };
        let items = self.list_paginated(url).await?;
        items
            .into_iter()
            .map(|v| serde_json::from_value(v).context("decoding pull request"))
            .collect()
    }

    pub async fn get_pr(&self, number: u64) -> Result<Option<RawPullRequest>> {
        let url = self.repo_url(&format!("pulls/{}", number))?;
        self.get_one(url).await
    }

    pub async fn list_commits(&self, sha_or_branch: &str) -> Result<Vec<Commit>> {
        let mut url = self.repo_url("commits")?;
        url.query_pairs_mut().append_pair("sha", sha_or_branch);
        let items = self.list_paginated(url).await?;
        items
            .into_iter()
            .map(|v| serde_json::from_value(v).context("decoding commit"))
            .collect()
    }

    pub async fn get_commit(&self, sha: &str) -> Result<Option<Commit>> {
        let url = self.repo_url(&format!("commits/{}", sha))?;
        self.get_one(url).await
    }

    pub async fn list_branches(&self) -> Result<Vec<Branch>> {
        let url = self.repo_url("branches")?;
        let items = self.list_paginated(url).await?;
        items
            .into_iter()
            .map(|v| serde_json::from_value(v).context("decoding branch"))
            .collect()
    }

    pub async fn get_branch(&self, name: &str) -> Result<Option<Branch>> {
        let url = self.repo_url(&format!("branches/{}", name))?;
        self.get_one(url).await
    }

    /// Lists commit statuses at `sha`, optionally filtered to a single
    /// `context`. Used both for PR categorisation and for the status
    /// reporter's idempotence check.
    pub async fn list_commit_statuses(
        &self,
        sha: &str,
        context: Option<&str>,
    ) -> Result<Vec<CommitStatus>> {
        let url = self.repo_url(&format!("commits/{}/statuses", sha))?;
        let items = self.list_paginated(url).await?;
        let statuses: Vec<CommitStatus> = items
            .into_iter()
            .map(|v| serde_json::from_value(v).context("decoding commit status"))
            .collect::<Result<_>>()?;

        Ok(match context {
            Some(context) => statuses
                .into_iter()
                .filter(|s| s.context == context)
                .collect(),
            None => statuses,
        })
    }

    /// Posts a new commit status. Callers are expected to have already
    /// checked `list_commit_statuses` for an identical existing entry;
    /// this call always creates.
    pub async fn create_commit_status(&self, sha: &str, status: &CommitStatus) -> Result<()> {
        let url = self.repo_url(&format!("statuses/{}", sha))?;
        self.http
            .post(url)
            .bearer_auth(self.token.expose_ref())
            .json(status)
            .send_retry_default()
            .await
            .context("posting commit status")?;
        Ok(())
    }

    pub async fn list_issue_comments(&self, issue_number: u64) -> Result<Vec<Comment>> {
        let url = self.repo_url(&format!("issues/{}/comments", issue_number))?;
        let items = self.list_paginated(url).await?;
        items
            .into_iter()
            .map(|v| serde_json::from_value(v).context("decoding comment"))
            .collect()
    }

    pub async fn create_issue_comment(&self, issue_number: u64, body: &str) -> Result<Comment> {
        let url = self.repo_url(&format!("issues/{}/comments", issue_number))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token.expose_ref())
            .json(&serde_json::json!({ "body": body }))
            .send_retry_default()
            .await
            .context("creating issue comment")?;
        response.json().await.context("decoding created comment")
    }

    pub async fn update_issue_comment(&self, comment_id: u64, body: &str) -> Result<()> {
        let url = self.repo_url(&format!("issues/comments/{}", comment_id))?;
        self.http
            .patch(url)
            .bearer_auth(self.token.expose_ref())
            .json(&serde_json::json!({ "body": body }))
            .send_retry_default()
            .await
            .context("updating issue comment")?;
        Ok(())
    }

    pub async fn list_issues(&self, state: &str) -> Result<Vec<Issue>> {
        let mut url = self.repo_url("issues")?;
        url.query_pairs_mut().append_pair("state", state);
        let items = self.list_paginated(url).await?;
        items
            .into_iter()
            .map(|v| serde_json::from_value(v).context("decoding issue"))
            .collect()
    }

    pub async fn create_issue(&self, title: &str, body: &str) -> Result<Issue> {
        let url = self.repo_url("issues")?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token.expose_ref())
            .json(&serde_json::json!({ "title": title, "body": body }))
            .send_retry_default()
            .await
            .context("creating issue")?;
        response.json().await.context("decoding created issue")
    }

    pub async fn close_issue(&self, issue_number: u64) -> Result<()> {
        let url = self.repo_url(&format!("issues/{}", issue_number))?;
        self.http
            .patch(url)
            .bearer_auth(self.token.expose_ref())
            .json(&serde_json::json!({ "state": "closed" }))
            .send_retry_default()
            .await
            .context("closing issue")?;
        Ok(())
    }

    pub async fn is_team_member(&self, team_slug: &str, login: &str) -> Result<bool> {
        let org = self.repo.split('/').next().unwrap_or(&self.repo);
        let url = self.base_url.join(&format!(
            "orgs/{}/teams/{}/memberships/{}",
            org, team_slug, login
        ))?;
        Ok(self.get_one::<serde_json::Value>(url).await?.is_some())
    }

    pub async fn is_collaborator(&self, login: &str) -> Result<bool> {
        let url = self.repo_url(&format!("collaborators/{}", login))?;
        Ok(self.get_one::<serde_json::Value>(url).await?.is_some())
    }

    pub async fn rate_limit(&self) -> Result<RateLimit> {
        let url = self.base_url.join("rate_limit")?;
        self.get_one(url)
            .await?
            .ok_or_else(|| anyhow!("rate_limit endpoint returned no body"))
    }

    async fn get_one<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        match self.conditional_get(url).await? {
            FetchOutcome::Absent => Ok(None),
            FetchOutcome::Fresh(body) | FetchOutcome::Cached(body) => {
                Ok(Some(serde_json::from_value(body)?))
            }
        }
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Extracts the `rel="next"` URL from a `Link` header, e.g.
/// `<https://host/resource?page=2>; rel="next", <...>; rel="last"`.
fn next_link_from(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let part = part.trim();
        if !part.contains("rel=\"next\"") {
            return None;
        }
        let start = part.find('<')?;
        let end = part.find('>')?;
        Some(part[start + 1..end].to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_next_link() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                "<https://api.example.com/repos/o/r/pulls?page=2>; rel=\"next\", <https://api.example.com/repos/o/r/pulls?page=5>; rel=\"last\"",
            ),
        );
        assert_eq!(
            next_link_from(&headers),
            Some("https://api.example.com/repos/o/r/pulls?page=2".to_string())
        );
    }

    #[test]
    fn no_link_header_yields_none() {
        let headers = HeaderMap::new();
        assert_eq!(next_link_from(&headers), None);
    }
}

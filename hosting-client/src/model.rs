use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Commit {
    pub sha: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Branch {
    pub name: String,
    pub commit: Commit,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PrHead {
    pub sha: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
}

/// Raw shape returned by the hosting service for a single pull request; the
/// fetcher turns this into a `crate::model::PullRequest` once it has also
/// looked at the head commit's status list.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RawPullRequest {
    pub number: u64,
    pub head: PrHead,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub user: RawUser,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RawUser {
    pub login: String,
}

/// A pull request as seen by the core scheduling pipeline: categorised,
/// immutable after fetch. `number` holds either the PR number (as a
/// string) or, for the optional main-branch pseudo-request, the branch
/// name.
#[derive(Clone, Debug)]
pub struct PullRequest {
    pub number: String,
    pub sha: String,
    pub created: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
    pub reviewed: bool,
    pub tested: bool,
    pub success: bool,
    pub fetched: DateTime<Utc>,
}

/// Equality is structural on `(number, sha)` only; this is the key used
/// for dedup throughout the priority queue and known-requests table, even
/// though two fetches of the same `(number, sha)` may otherwise disagree
/// (e.g. a status landed between polls).
impl PartialEq for PullRequest {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number && self.sha == other.sha
    }
}

impl Eq for PullRequest {}

impl std::hash::Hash for PullRequest {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.number.hash(state);
        self.sha.hash(state);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitStatusState {
    Pending,
    Success,
    Error,
    Failure,
}

impl std::fmt::Display for CommitStatusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommitStatusState::Pending => "pending",
            CommitStatusState::Success => "success",
            CommitStatusState::Error => "error",
            CommitStatusState::Failure => "failure",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct CommitStatus {
    pub state: CommitStatusState,
    pub context: String,
    pub description: String,
    pub target_url: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub state: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Comment {
    pub id: u64,
    pub body: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
    pub reset: i64,
}

use crate::config::Config;
use anyhow::Result;
use chrono::{DateTime, Utc};
use hosting_client::model::{CommitStatusState, PullRequest, RawPullRequest};
use hosting_client::HostingClient;

/// The three buckets every reviewed PR falls into; `priority()` is the
/// number the scheduler orders on (lower is more urgent).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Category {
    NotTested,
    TestedFail,
    TestedSuccess,
}

impl Category {
    pub fn priority(self) -> u8 {
        match self {
            Category::NotTested => 0,
            Category::TestedFail => 1,
            Category::TestedSuccess => 2,
        }
    }
}

/// Looks at `raw`'s head-commit status list and decides whether it is
/// reviewed, and if so which category it falls into. Returns `None` for
/// unreviewed requests (the caller should log and drop them).
///
/// A match on `config.check_name` sets `tested`/`success` from that
/// status's state; a match on the review context with state `success`
/// sets `reviewed` alone. If neither status is present, review can still
/// be granted by author trust, which costs the extra API calls in
/// `is_trusted` and is only attempted when at least one trust mechanism
/// is configured.
pub async fn categorise(
    client: &HostingClient,
    config: &Config,
    raw: RawPullRequest,
    now: DateTime<Utc>,
) -> Result<Option<(u8, PullRequest)>> {
    let statuses = client.list_commit_statuses(&raw.head.sha, None).await?;

    let mut reviewed = false;
    let mut tested = false;
    let mut success = false;

    for status in &statuses {
        if status.context == config.check_name {
            reviewed = true;
            tested = matches!(
                status.state,
                CommitStatusState::Success | CommitStatusState::Error | CommitStatusState::Failure
            );
            success = status.state == CommitStatusState::Success;
            // Statuses are returned newest-first; stop at the first match
            // so a later (older) status for the same check can't overwrite
            // the current tested/success verdict.
            break;
        } else if status.context == config.review_status_context && status.state == CommitStatusState::Success {
            reviewed = true;
        }
    }

    if !reviewed && trust_configured(config) {
        reviewed = is_trusted(client, config, &raw.user.login).await?;
    }

    if !reviewed {
        log::info!("dropping PR #{}: not reviewed", raw.number);
        return Ok(None);
    }

    let category = match (tested, success) {
        (false, _) => Category::NotTested,
        (true, true) => Category::TestedSuccess,
        (true, false) => Category::TestedFail,
    };

    let pr = PullRequest {
        number: raw.number.to_string(),
        sha: raw.head.sha,
        created: raw.created_at,
        updated: raw.updated_at,
        reviewed,
        tested,
        success,
        fetched: now,
    };

    Ok(Some((category.priority(), pr)))
}

fn trust_configured(config: &Config) -> bool {
    config.trust_collaborators || !config.trusted_users.is_empty() || config.trusted_team.is_some()
}

async fn is_trusted(client: &HostingClient, config: &Config, login: &str) -> Result<bool> {
    if config.trusted_users.iter().any(|u| u == login) {
        return Ok(true);
    }
    if let Some(team) = &config.trusted_team {
        if client.is_team_member(team, login).await? {
            return Ok(true);
        }
    }
    if config.trust_collaborators && client.is_collaborator(login).await? {
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_priorities_are_ordered_not_tested_first() {
        assert_eq!(Category::NotTested.priority(), 0);
        assert_eq!(Category::TestedFail.priority(), 1);
        assert_eq!(Category::TestedSuccess.priority(), 2);
    }
}

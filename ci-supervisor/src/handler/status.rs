use anyhow::Result;
use hosting_client::model::CommitStatus;
use hosting_client::HostingClient;

/// Posts commit statuses idempotently: fetches the existing statuses at
/// the commit filtered by `context`, and only creates a new one if the
/// most recent entry does not already match all four fields.
pub struct StatusReporter {
    client: HostingClient,
}

impl StatusReporter {
    pub fn new(client: HostingClient) -> Self {
        Self { client }
    }

    pub async fn post(&self, sha: &str, status: &CommitStatus) -> Result<()> {
        let existing = self.client.list_commit_statuses(sha, Some(&status.context)).await?;

        if existing.first() == Some(status) {
            return Ok(());
        }

        self.client.create_commit_status(sha, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hosting_client::model::CommitStatusState;

    fn status(state: CommitStatusState, description: &str) -> CommitStatus {
        CommitStatus {
            state,
            context: "build/O2".to_string(),
            description: description.to_string(),
            target_url: "https://example.com".to_string(),
        }
    }

    #[test]
    fn identical_status_compares_equal_field_wise() {
        let a = status(CommitStatusState::Pending, "building");
        let b = status(CommitStatusState::Pending, "building");
        assert_eq!(a, b);
    }

    #[test]
    fn differing_description_is_not_equal() {
        let a = status(CommitStatusState::Pending, "building");
        let b = status(CommitStatusState::Pending, "still building");
        assert_ne!(a, b);
    }
}

use anyhow::Result;
use hosting_client::HostingClient;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

static HEX_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9a-fA-F]{6,}").unwrap());
static DATE_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}([T ]\d{2}:\d{2}:\d{2}(\.\d+)?)?").unwrap());

/// Which error this comment/issue reports, used only to pick a stable
/// prefix so unrelated comments on the same PR are never mistaken for
/// ours.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IssueKind {
    DiffTooBig,
    BuildFailure,
}

impl IssueKind {
    fn prefix(self) -> &'static str {
        match self {
            IssueKind::DiffTooBig => "<!-- ci-bot:diff-too-big -->",
            IssueKind::BuildFailure => "<!-- ci-bot:build-failure -->",
        }
    }
}

/// Hashes `message` after filtering hexadecimal and date-like runs and
/// sorting lines, so unrelated churn in a sha or a timestamp — or lines
/// merely being reordered — does not change the hash (testable property
/// 6).
pub fn calculate_message_hash(message: &str) -> String {
    let mut lines: Vec<String> = message
        .lines()
        .map(|line| {
            let line = HEX_RUN.replace_all(line, "<HEX>");
            DATE_RUN.replace_all(&line, "<DATE>").into_owned()
        })
        .collect();
    lines.sort();

    let mut hasher = DefaultHasher::new();
    lines.join("\n").hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub struct IssueReporter {
    client: HostingClient,
}

impl IssueReporter {
    pub fn new(client: HostingClient) -> Self {
        Self { client }
    }

    /// Reports `message` against a real pull request's issue thread
    /// (every PR is also an issue on the hosting service): if an existing
    /// comment carries this kind's prefix and matches the hash, do
    /// nothing; if the prefix matches but the hash does not, update that
    /// comment; otherwise create a new one.
    pub async fn report_for_pr(&self, pr_number: u64, kind: IssueKind, message: &str) -> Result<()> {
        let hash = calculate_message_hash(message);
        let prefix = kind.prefix();
        let body = format!("{}{}\n\n{}", prefix, hash, message);

        let comments = self.client.list_issue_comments(pr_number).await?;
        for comment in &comments {
            if let Some(rest) = comment.body.strip_prefix(prefix) {
                let existing_hash = rest.lines().next().unwrap_or("");
                if existing_hash == hash {
                    return Ok(());
                }
                self.client.update_issue_comment(comment.id, &body).await?;
                return Ok(());
            }
        }

        self.client.create_issue_comment(pr_number, &body).await?;
        Ok(())
    }

    /// Reports `message` against the main-branch pseudo-request: issues
    /// are titled `<branch>@<sha>: <hash>`. An open issue whose title
    /// starts with `<branch>@` is this bot's standing report for that
    /// branch; if its title already matches exactly, nothing changes; if
    /// it differs, the stale issue is closed and a fresh one opened.
    pub async fn report_for_branch(&self, branch: &str, sha: &str, _kind: IssueKind, message: &str) -> Result<()> {
        let hash = calculate_message_hash(message);
        let title = format!("{}@{}: {}", branch, sha, hash);
        let title_prefix = format!("{}@", branch);

        let open_issues = self.client.list_issues("open").await?;
        for issue in &open_issues {
            if issue.title.starts_with(&title_prefix) {
                if issue.title == title {
                    return Ok(());
                }
                self.client.close_issue(issue.number).await?;
                break;
            }
        }

        self.client.create_issue(&title, message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_under_hex_substitution() {
        let a = "build failed at commit abcdef1234567890\nsee logs";
        let b = "build failed at commit 1122334455667788\nsee logs";
        assert_eq!(calculate_message_hash(a), calculate_message_hash(b));
    }

    #[test]
    fn hash_is_stable_under_line_reordering() {
        let a = "line one\nline two abcdef123456";
        let b = "line two 1234567890ab\nline one";
        assert_eq!(calculate_message_hash(a), calculate_message_hash(b));
    }

    #[test]
    fn hash_changes_for_genuinely_different_text() {
        let a = "build failed: missing header";
        let b = "build failed: linker error";
        assert_ne!(calculate_message_hash(a), calculate_message_hash(b));
    }
}

use anyhow::{bail, Result};
use ci_common::process::run_cmd_with_timeout;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub struct MergeOutcome {
    pub upstream_sha: String,
    pub size_diff: i64,
}

pub enum MergeResult {
    Merged(MergeOutcome),
    Conflict,
    TooBig { size_diff: i64 },
}

/// Runs the merge stage against `checkout`: reset to
/// upstream, configure the pull-request refspec, fetch, clean, record
/// pre-merge size, attempt the merge, and on success reset/clean again and
/// compare sizes against `max_diff_size`.
pub async fn run_merge(
    checkout: &Path,
    branch: &str,
    pr_number: &str,
    pr_sha: &str,
    max_diff_size: u64,
    git_timeout: Duration,
) -> Result<MergeResult> {
    git(checkout, &["reset", "--hard", &format!("origin/{}", branch)], git_timeout).await?;
    git(
        checkout,
        &[
            "config",
            "--add",
            "remote.origin.fetch",
            "+refs/pull/*/head:refs/remotes/origin/pr/*",
        ],
        git_timeout,
    )
    .await?;
    git(checkout, &["fetch", "origin", &format!("pull/{}/head", pr_number)], git_timeout).await?;
    git(checkout, &["clean", "-fxd"], git_timeout).await?;

    let pre_merge_size = ci_common::fs::dir_size_excluding(checkout, ".git").await?;
    let upstream_sha = git_output(checkout, &["rev-parse", "HEAD"], git_timeout).await?;

    if git(checkout, &["merge", "--no-edit", pr_sha], git_timeout).await.is_err() {
        let _ = git(checkout, &["merge", "--abort"], git_timeout).await;
        return Ok(MergeResult::Conflict);
    }

    git(checkout, &["reset", "--hard", "HEAD"], git_timeout).await?;
    git(checkout, &["clean", "-fxd"], git_timeout).await?;
    let post_merge_size = ci_common::fs::dir_size_excluding(checkout, ".git").await?;
    let size_diff = post_merge_size as i64 - pre_merge_size as i64;

    if size_diff > max_diff_size as i64 {
        return Ok(MergeResult::TooBig { size_diff });
    }

    Ok(MergeResult::Merged(MergeOutcome {
        upstream_sha,
        size_diff,
    }))
}

async fn git(checkout: &Path, args: &[&str], timeout: Duration) -> Result<()> {
    let argv = args.iter().map(|s| s.to_string()).collect();
    let output = run_cmd_with_timeout(
        "git",
        argv,
        HashMap::<String, String>::new(),
        Some(checkout.to_path_buf()),
        timeout,
    )
    .await?;

    if !output.exit_status.success {
        bail!("git {:?} failed: {}", args, output.stderr);
    }
    Ok(())
}

async fn git_output(checkout: &Path, args: &[&str], timeout: Duration) -> Result<String> {
    let argv = args.iter().map(|s| s.to_string()).collect();
    let output = run_cmd_with_timeout(
        "git",
        argv,
        HashMap::<String, String>::new(),
        Some(checkout.to_path_buf()),
        timeout,
    )
    .await?;

    if !output.exit_status.success {
        bail!("git {:?} failed: {}", args, output.stderr);
    }
    Ok(output.stdout.trim().to_string())
}

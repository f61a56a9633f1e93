use crate::config::Config;
use anyhow::Result;
use std::path::Path;

/// Deletes any `latest*` symlinks/directories left over from a previous
/// build, so a fresh build does not silently reuse stale artifacts.
pub async fn clear_stale_artifacts(checkout: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(checkout).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("latest") {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
    }
    Ok(())
}

/// Builds the `aliBuild build` argv: job-count, defaults, debug,
/// remote-store, mirror, and an externals-identifier set
/// only when consistent-externals is disabled (in which case it is keyed
/// on the PR number, so externals built for one PR are never reused by
/// another whose dependency set may have drifted).
pub fn build_argv(config: &Config, pr_number: &str) -> Vec<String> {
    let mut argv = vec![
        "build".to_string(),
        config.package.clone(),
        "--defaults".to_string(),
        config.alibuild_defaults.clone(),
    ];

    if let Some(jobs) = config.jobs {
        argv.push("-j".to_string());
        argv.push(jobs.to_string());
    }
    if config.debug {
        argv.push("--debug".to_string());
    }
    if let Some(remote_store) = &config.remote_store {
        argv.push("--remote-store".to_string());
        argv.push(remote_store.clone());
    }
    if let Some(mirror) = &config.mirror {
        argv.push("--reference-sources".to_string());
        argv.push(mirror.clone());
    }
    if !config.consistent_externals {
        argv.push("--externals-identifier".to_string());
        argv.push(format!("pr-{}", pr_number));
    }

    argv
}

pub fn diagnose_argv(config: &Config) -> Vec<String> {
    vec![config.package.clone()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        std::env::set_var("GITHUB_TOKEN", "tok");
        std::env::set_var("PR_REPO", "alisw/alidist");
        std::env::set_var("PR_REPO_CHECKOUT", "/tmp/checkout");
        let config = Config::from_env().unwrap();
        std::env::remove_var("GITHUB_TOKEN");
        std::env::remove_var("PR_REPO");
        std::env::remove_var("PR_REPO_CHECKOUT");
        config
    }

    #[test]
    fn externals_identifier_only_set_when_inconsistent() {
        let mut config = base_config();
        config.consistent_externals = true;
        assert!(!build_argv(&config, "123").contains(&"--externals-identifier".to_string()));

        config.consistent_externals = false;
        let argv = build_argv(&config, "123");
        let idx = argv.iter().position(|a| a == "--externals-identifier").unwrap();
        assert_eq!(argv[idx + 1], "pr-123");
    }
}

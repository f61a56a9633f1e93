use anyhow::{Context, Result};
use ci_common::secret::Secret;
use std::time::Duration;

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_duration_secs(name: &str, default: u64) -> Duration {
    let secs = env_var(name)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env_var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env_var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str) -> bool {
    matches!(
        env_var(name).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

/// Configuration resolved once at startup from environment variables (see
/// the HTTP/env surface). Constructed explicitly in `main` and passed down
/// to the workers that need it, rather than read piecemeal from `env::var`
/// throughout the tree.
#[derive(Clone)]
pub struct Config {
    pub github_token: Secret<String>,
    pub github_cache_path: String,

    pub pr_repo: String,
    pub pr_branch: String,
    pub pr_repo_checkout: String,

    pub max_diff_size: u64,
    pub max_wait_no_prs: Duration,
    pub max_wait_no_new_prs: Duration,
    pub delay_between_fetches: Duration,

    pub check_name: String,
    pub review_status_context: String,
    pub package: String,
    pub mirror: Option<String>,
    pub alibuild_defaults: String,
    pub alibuild_repo: Option<String>,
    pub jobs: Option<u32>,
    pub debug: bool,
    pub remote_store: Option<String>,
    pub consistent_externals: bool,
    pub build_suffix: Option<String>,

    pub trust_collaborators: bool,
    pub trusted_users: Vec<String>,
    pub trusted_team: Option<String>,

    /// Whether the tip of `pr_branch` is also emitted as a pseudo-request
    /// alongside real PRs, exposed as a plain boolean flag rather than
    /// hardcoding the behavior on or off.
    pub main_branch_pseudo_request: bool,

    pub worker_index: usize,
    pub workers_pool_size: usize,
    pub ci_name: Option<String>,

    pub monalisa_host: String,
    pub monalisa_port: u16,
    pub monalisa_metric_path: String,

    pub alidoctor_timeout: Duration,
    pub alibuild_timeout: Duration,
    pub git_pull_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_token = env_var("GITHUB_TOKEN")
            .context("GITHUB_TOKEN is required")?
            .into();

        let trusted_users = env_var("TRUSTED_USERS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|| vec!["review".to_string()]);

        let pr_repo = env_var("PR_REPO").context("PR_REPO is required")?;
        let pr_repo_checkout = env_var("PR_REPO_CHECKOUT").unwrap_or_else(|| {
            pr_repo
                .rsplit('/')
                .next()
                .unwrap_or(&pr_repo)
                .to_string()
        });

        Ok(Self {
            github_token,
            github_cache_path: env_var("GITHUB_CACHE_CLIENT")
                .unwrap_or_else(|| ".github-cache".to_string()),

            pr_repo,
            pr_branch: env_var("PR_BRANCH").unwrap_or_else(|| "master".to_string()),
            pr_repo_checkout,

            max_diff_size: env_u64("MAX_DIFF_SIZE", 20_000_000),
            max_wait_no_prs: env_duration_secs("MAX_WAIT_NO_PRS", 1_200),
            max_wait_no_new_prs: env_duration_secs("MAX_WAIT_NO_NEW_PRS", 1_200),
            delay_between_fetches: env_duration_secs("DELAY", 30),

            check_name: env_var("CHECK_NAME").unwrap_or_else(|| "build/AliPhysics/release".to_string()),
            review_status_context: env_var("REVIEW_STATUS_CONTEXT").unwrap_or_else(|| "review".to_string()),
            package: env_var("PACKAGE").unwrap_or_else(|| "AliPhysics".to_string()),
            mirror: env_var("MIRROR"),
            alibuild_defaults: env_var("ALIBUILD_DEFAULTS").unwrap_or_else(|| "release".to_string()),
            alibuild_repo: env_var("ALIBUILD_REPO"),
            jobs: env_var("JOBS").and_then(|v| v.parse().ok()),
            debug: env_bool("DEBUG"),
            remote_store: env_var("REMOTE_STORE"),
            consistent_externals: !env_bool("NO_ASSUME_CONSISTENT_EXTERNALS"),
            build_suffix: env_var("BUILD_SUFFIX"),

            trust_collaborators: env_bool("TRUST_COLLABORATORS"),
            trusted_users,
            trusted_team: env_var("TRUSTED_TEAM"),
            main_branch_pseudo_request: env_bool("PR_BRANCH_PSEUDO_REQUEST"),

            worker_index: env_usize("WORKER_INDEX", 0),
            workers_pool_size: env_usize("WORKERS_POOL_SIZE", 1),
            ci_name: env_var("CI_NAME"),

            monalisa_host: env_var("MONALISA_HOST").unwrap_or_else(|| "localhost".to_string()),
            monalisa_port: env_var("MONALISA_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8889),
            monalisa_metric_path: env_var("MONALISA_METRIC_PATH")
                .unwrap_or_else(|| "ci.alibuild".to_string()),

            alidoctor_timeout: env_duration_secs("ALIDOCTOR_PROCESS_TIMEOUT", 120),
            alibuild_timeout: env_duration_secs("ALIBUILD_PROCESS_TIMEOUT", 3600),
            git_pull_timeout: env_duration_secs("GIT_PULL_TIMEOUT", 120),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn from_env_requires_github_token() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("GITHUB_TOKEN");
        std::env::remove_var("PR_REPO");
        std::env::remove_var("PR_REPO_CHECKOUT");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn from_env_applies_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("GITHUB_TOKEN", "tok");
        std::env::set_var("PR_REPO", "alisw/alidist");
        std::env::set_var("PR_REPO_CHECKOUT", "/tmp/checkout");
        std::env::remove_var("MAX_DIFF_SIZE");
        std::env::remove_var("TRUSTED_USERS");

        let config = Config::from_env().unwrap();
        assert_eq!(config.max_diff_size, 20_000_000);
        assert_eq!(config.pr_branch, "master");
        assert!(config.consistent_externals);
        assert_eq!(config.trusted_users, vec!["review".to_string()]);

        std::env::remove_var("GITHUB_TOKEN");
        std::env::remove_var("PR_REPO");
        std::env::remove_var("PR_REPO_CHECKOUT");
    }

    #[test]
    fn from_env_derives_repo_checkout_from_pr_repo() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("GITHUB_TOKEN", "tok");
        std::env::set_var("PR_REPO", "alisw/alidist");
        std::env::remove_var("PR_REPO_CHECKOUT");

        let config = Config::from_env().unwrap();
        assert_eq!(config.pr_repo_checkout, "alidist");

        std::env::remove_var("GITHUB_TOKEN");
        std::env::remove_var("PR_REPO");
    }
}

mod build;
mod issue;
mod merge;
mod status;

use crate::broker::{Args, Broker, ParentMessage, Reply};
use crate::config::Config;
use crate::worker::WorkerCore;
use ci_common::process::Output;
use ci_telemetry::metrics::{emit, MetricSender};
use hosting_client::model::{CommitStatus, CommitStatusState, PullRequest};
use hosting_client::HostingClient;
use issue::{IssueKind, IssueReporter};
use status::StatusReporter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Single-shot merge → diagnose → build pipeline for one pull request. A
/// handler exists for exactly one request; its death (crash or shutdown)
/// is terminal for that request, never restarted in place (the PR-builder
/// parent just re-fetches and re-schedules it if it is still open).
pub struct Handler {
    core: WorkerCore,
    client: HostingClient,
    config: Arc<Config>,
    metrics: MetricSender,
    request: PullRequest,
    status: StatusReporter,
    issues: IssueReporter,
}

impl Handler {
    pub fn new(
        broker: Broker,
        client: HostingClient,
        config: Arc<Config>,
        metrics: MetricSender,
        request: PullRequest,
    ) -> Self {
        Self {
            core: WorkerCore::new(format!("handler-{}", request.number), broker),
            status: StatusReporter::new(client.clone()),
            issues: IssueReporter::new(client.clone()),
            client,
            config,
            metrics,
            request,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<ParentMessage>) {
        self.core.set_started();
        let start = Instant::now();

        if let Err(e) = self.prepare().await {
            log::warn!("handler {}: prepare failed: {}", self.request.number, e);
            self.finish(start).await;
            return;
        }

        let upstream_sha = match self.merge(&mut rx).await {
            Ok(Some(sha)) => sha,
            Ok(None) => {
                self.finish(start).await;
                return;
            }
            Err(e) => {
                log::warn!("handler {}: merge stage errored: {}", self.request.number, e);
                self.finish(start).await;
                return;
            }
        };
        let _ = upstream_sha;

        if self.core.shutdown {
            self.finish(start).await;
            return;
        }

        match self.diagnose(&mut rx).await {
            Ok(true) => {}
            Ok(false) => {
                self.finish(start).await;
                return;
            }
            Err(e) => {
                log::warn!("handler {}: diagnose stage errored: {}", self.request.number, e);
                self.finish(start).await;
                return;
            }
        }

        if self.core.shutdown {
            self.finish(start).await;
            return;
        }

        if let Err(e) = self.build(&mut rx).await {
            log::warn!("handler {}: build stage errored: {}", self.request.number, e);
        }

        self.finish(start).await;
    }

    async fn finish(&self, start: Instant) {
        emit(&self.metrics, "pr_build_time", start.elapsed().as_secs_f64());
    }

    async fn prepare(&mut self) -> anyhow::Result<()> {
        log::info!("handler {}: preparing", self.request.number);
        self.post_status(
            CommitStatusState::Pending,
            "Merging and building",
        )
        .await
    }

    /// Returns `Ok(Some(upstream_sha))` on a successful merge within
    /// budget, `Ok(None)` if the pipeline should stop here (conflict, diff
    /// too big, or a shutdown arrived mid-stage).
    async fn merge(&mut self, rx: &mut mpsc::Receiver<ParentMessage>) -> anyhow::Result<Option<String>> {
        let checkout = std::path::PathBuf::from(&self.config.pr_repo_checkout);
        let branch = self.config.pr_branch.clone();
        let pr_number = self.request.number.clone();
        let pr_sha = self.request.sha.clone();
        let max_diff_size = self.config.max_diff_size;
        let git_timeout = self.config.git_pull_timeout;

        let mut handle: JoinHandle<anyhow::Result<merge::MergeResult>> = tokio::spawn(async move {
            merge::run_merge(&checkout, &branch, &pr_number, &pr_sha, max_diff_size, git_timeout).await
        });

        let result = loop {
            tokio::select! {
                res = &mut handle => {
                    break res?;
                }
                msg = rx.recv() => {
                    match self.handle_during_stage(msg, &mut handle).await {
                        StageControl::Continue => {}
                        StageControl::Stop => return Ok(None),
                    }
                }
            }
        };

        match result? {
            merge::MergeResult::Merged(outcome) => Ok(Some(outcome.upstream_sha)),
            merge::MergeResult::Conflict => {
                self.post_status(CommitStatusState::Error, "Cannot merge PR into test area")
                    .await?;
                Ok(None)
            }
            merge::MergeResult::TooBig { size_diff } => {
                self.post_status(CommitStatusState::Error, "Diff too big, rejecting.")
                    .await?;
                self.report_failure(
                    IssueKind::DiffTooBig,
                    &format!(
                        "The diff introduced by this pull request grew the checkout by {} bytes, \
                         which is over the configured limit of {} bytes.",
                        size_diff, self.config.max_diff_size
                    ),
                )
                .await?;
                Ok(None)
            }
        }
    }

    async fn diagnose(&mut self, rx: &mut mpsc::Receiver<ParentMessage>) -> anyhow::Result<bool> {
        let argv = build::diagnose_argv(&self.config);
        let output = self
            .run_stage("aliDoctor", argv, self.config.alidoctor_timeout, rx)
            .await?;

        match output {
            None => Ok(false),
            Some(output) if output.exit_status.success => Ok(true),
            Some(_) => {
                self.post_status(CommitStatusState::Error, "aliDoctor error").await?;
                Ok(false)
            }
        }
    }

    async fn build(&mut self, rx: &mut mpsc::Receiver<ParentMessage>) -> anyhow::Result<()> {
        let checkout = std::path::PathBuf::from(&self.config.pr_repo_checkout);
        build::clear_stale_artifacts(&checkout).await?;

        let argv = build::build_argv(&self.config, &self.request.number);
        let output = self
            .run_stage("aliBuild", argv, self.config.alibuild_timeout, rx)
            .await?;

        match output {
            None => Ok(()),
            Some(output) if output.exit_status.success => {
                self.post_status(CommitStatusState::Success, "Build successful").await
            }
            Some(output) => {
                self.post_status(CommitStatusState::Failure, "Build failed").await?;
                self.report_failure(
                    IssueKind::BuildFailure,
                    &format!("Build failed:\n\n{}\n{}", output.stdout, output.stderr),
                )
                .await
            }
        }
    }

    /// Spawns `program argv` as an abortable task and races it against the
    /// parent channel so a `shutdown` can terminate it immediately rather
    /// than waiting out the stage's full timeout.
    async fn run_stage(
        &mut self,
        program: &str,
        argv: Vec<String>,
        timeout: Duration,
        rx: &mut mpsc::Receiver<ParentMessage>,
    ) -> anyhow::Result<Option<Output>> {
        let checkout = std::path::PathBuf::from(&self.config.pr_repo_checkout);
        let program = program.to_string();
        let mut handle: JoinHandle<anyhow::Result<Output>> = tokio::spawn(async move {
            ci_common::process::run_cmd_with_timeout(
                program,
                argv,
                HashMap::<String, String>::new(),
                Some(checkout),
                timeout,
            )
            .await
        });

        loop {
            tokio::select! {
                res = &mut handle => {
                    return Ok(Some(res??));
                }
                msg = rx.recv() => {
                    match self.handle_during_stage(msg, &mut handle).await {
                        StageControl::Continue => {}
                        StageControl::Stop => return Ok(None),
                    }
                }
            }
        }
    }

    async fn handle_during_stage<T: Send + 'static>(
        &mut self,
        msg: Option<ParentMessage>,
        handle: &mut JoinHandle<T>,
    ) -> StageControl {
        match msg {
            Some(ParentMessage::Tell(env)) if env.message == "shutdown" => {
                handle.abort();
                self.core.shutdown = true;
                StageControl::Stop
            }
            Some(ParentMessage::Ask(env, reply_tx)) if env.message == "shutdown" => {
                handle.abort();
                self.core.shutdown = true;
                let _ = reply_tx.send(Reply::ok(self.core.name.clone(), Args::Null));
                StageControl::Stop
            }
            Some(ParentMessage::Tell(env)) => {
                let _ = self.core.dispatch_common(&env.message).await;
                StageControl::Continue
            }
            Some(ParentMessage::Ask(env, reply_tx)) => {
                let payload = self.core.dispatch_common(&env.message).await.unwrap_or(Args::Null);
                let _ = reply_tx.send(Reply::ok(self.core.name.clone(), payload));
                StageControl::Continue
            }
            None => {
                handle.abort();
                StageControl::Stop
            }
        }
    }

    /// Routes a pipeline failure to the right issue-reporting path: a
    /// real pull request (numeric `number`) gets a comment on its own
    /// issue thread; the main-branch pseudo-request (`number` is the
    /// branch name) gets the `branch@sha:hash` titled-issue flow instead,
    /// mirroring the original's `handle_pr` vs `handle_branch` dispatch on
    /// whether the id is a digit string.
    async fn report_failure(&self, kind: IssueKind, message: &str) -> anyhow::Result<()> {
        match self.request.number.parse::<u64>() {
            Ok(pr_number) => self.issues.report_for_pr(pr_number, kind, message).await,
            Err(_) => {
                self.issues
                    .report_for_branch(&self.request.number, &self.request.sha, kind, message)
                    .await
            }
        }
    }

    async fn post_status(&self, state: CommitStatusState, description: &str) -> anyhow::Result<()> {
        let status = CommitStatus {
            state,
            context: self.config.check_name.clone(),
            description: description.to_string(),
            target_url: String::new(),
        };

        if let Err(e) = self.status.post(&self.request.sha, &status).await {
            log::warn!(
                "handler {}: failed to post status {:?}: {}",
                self.request.number,
                state,
                e
            );
            emit(&self.metrics, "status_post_failure", 1.0);
        }
        Ok(())
    }
}

enum StageControl {
    Continue,
    Stop,
}

mod categorize;
mod known_requests;

pub use known_requests::KnownRequests;

use crate::broker::{Args, Broker, ParentMessage, Reply};
use crate::config::Config;
use crate::worker::{poll_parent, WorkerCore, PARENT_POLL_TIMEOUT};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ci_telemetry::metrics::{emit, MetricSender};
use hosting_client::model::PullRequest;
use hosting_client::HostingClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Periodically polls the hosting service, diffs against what is already
/// known, and pushes new/stale `(priority, request)` pairs onto the
/// results channel the PR-builder parent drains. Owns `known_prs`
/// exclusively; no other worker ever sees it directly.
pub struct Fetcher {
    core: WorkerCore,
    client: HostingClient,
    config: Arc<Config>,
    metrics: MetricSender,
    known: KnownRequests,
    results_tx: mpsc::Sender<(u8, PullRequest)>,
    last_nonempty: DateTime<Utc>,
    sleep_handle: Option<JoinHandle<()>>,
}

impl Fetcher {
    pub fn new(
        broker: Broker,
        client: HostingClient,
        config: Arc<Config>,
        metrics: MetricSender,
        results_tx: mpsc::Sender<(u8, PullRequest)>,
    ) -> Self {
        Self {
            core: WorkerCore::new("fetcher", broker),
            client,
            config,
            metrics,
            known: KnownRequests::new(),
            results_tx,
            last_nonempty: Utc::now(),
            sleep_handle: None,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<ParentMessage>) {
        self.core.set_started();

        loop {
            if self.core.shutdown {
                break;
            }

            if let Some(msg) = poll_parent(&mut rx, PARENT_POLL_TIMEOUT).await {
                if self.dispatch(msg).await {
                    break;
                }
            }
            if self.core.shutdown {
                break;
            }

            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => {
                    log::info!("fetcher: no PRs for longer than max_wait_no_prs, shutting down");
                    self.core.shutdown = true;
                    break;
                }
                Err(e) => log::warn!("fetcher: poll failed: {}", e),
            }

            if let Err(e) = self.client.flush_cache().await {
                log::warn!("fetcher: failed to persist hosting-service cache: {}", e);
            }

            self.interruptible_sleep(self.config.delay_between_fetches, &mut rx)
                .await;
        }
    }

    /// Returns `true` if the run loop should stop (a `shutdown` verb was
    /// handled here rather than deferred to `dispatch_common`, since the
    /// fetcher's shutdown also needs to kill its sleep child and close the
    /// results channel).
    async fn dispatch(&mut self, msg: ParentMessage) -> bool {
        match msg {
            ParentMessage::Tell(env) if env.message == "shutdown" => {
                self.shutdown().await;
                true
            }
            ParentMessage::Ask(env, reply_tx) if env.message == "shutdown" => {
                self.shutdown().await;
                let _ = reply_tx.send(Reply::ok(self.core.name.clone(), Args::Null));
                true
            }
            ParentMessage::Tell(env) => {
                let _ = self.core.dispatch_common(&env.message).await;
                false
            }
            ParentMessage::Ask(env, reply_tx) => {
                let payload = self
                    .core
                    .dispatch_common(&env.message)
                    .await
                    .unwrap_or(Args::Null);
                let _ = reply_tx.send(Reply::ok(self.core.name.clone(), payload));
                false
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(handle) = self.sleep_handle.take() {
            handle.abort();
        }
        self.core.shutdown = true;
    }

    async fn interruptible_sleep(&mut self, duration: Duration, rx: &mut mpsc::Receiver<ParentMessage>) {
        let mut handle = tokio::spawn(crate::sleep::run(ci_common::jitter::jitter(duration)));
        self.sleep_handle = None;

        loop {
            tokio::select! {
                _ = &mut handle => {
                    return;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(ParentMessage::Tell(env)) if env.message == "shutdown" => {
                            handle.abort();
                            self.core.shutdown = true;
                            return;
                        }
                        Some(ParentMessage::Ask(env, reply_tx)) if env.message == "shutdown" => {
                            handle.abort();
                            self.core.shutdown = true;
                            let _ = reply_tx.send(Reply::ok(self.core.name.clone(), Args::Null));
                            return;
                        }
                        Some(ParentMessage::Tell(env)) => {
                            let _ = self.core.dispatch_common(&env.message).await;
                        }
                        Some(ParentMessage::Ask(env, reply_tx)) => {
                            let payload = self.core.dispatch_common(&env.message).await.unwrap_or(Args::Null);
                            let _ = reply_tx.send(Reply::ok(self.core.name.clone(), payload));
                        }
                        None => {
                            handle.abort();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One full fetch tick: lists open PRs, categorises each, diffs
    /// against what's already known, and emits the new/changed ones.
    /// Returns `Ok(false)` when the no-PRs timeout has been exceeded and
    /// the fetcher should exit.
    async fn poll_once(&mut self) -> Result<bool> {
        let raw_prs = self.client.list_open_prs(&self.config.pr_branch).await?;
        let now = Utc::now();

        let mut categorised = Vec::new();
        for raw in raw_prs {
            if let Some(pair) = categorize::categorise(&self.client, &self.config, raw, now).await? {
                categorised.push(pair);
            }
        }

        if let Some(pseudo) = self.main_branch_pseudo_request(now).await? {
            categorised.push(pseudo);
        }

        emit(&self.metrics, "number_prs", categorised.len() as f64);

        if categorised.is_empty() {
            let no_prs_for = now.signed_duration_since(self.last_nonempty);
            let max_wait = ChronoDuration::from_std(self.config.max_wait_no_prs).unwrap_or(ChronoDuration::zero());
            if no_prs_for > max_wait {
                return Ok(false);
            }
        } else {
            self.last_nonempty = now;
        }

        let mut new_entries = Vec::new();
        for (priority, mut request) in categorised.clone() {
            if !self.known.contains(priority, &request) {
                request.fetched = now;
                let baseline = request.updated.unwrap_or(request.created);
                let time_to_fetch = now.signed_duration_since(baseline);
                emit(&self.metrics, "time_to_fetch", time_to_fetch.num_seconds() as f64);
                log::info!("new pr {} (priority {})", request.number, priority);
                new_entries.push((priority, request));
            }
        }

        if !new_entries.is_empty() {
            self.known.add_all(new_entries.clone(), now);
            emit(&self.metrics, "number_new_prs", new_entries.len() as f64);
            for pair in new_entries {
                if self.results_tx.send(pair).await.is_err() {
                    break;
                }
            }
        } else {
            let stale = self.known.older_than(self.config.max_wait_no_new_prs, now);
            if !stale.is_empty() {
                for pair in stale.clone() {
                    if self.results_tx.send(pair).await.is_err() {
                        break;
                    }
                }
                self.known.reset(&stale, now);
            }
        }

        let still_present: Vec<PullRequest> = categorised.into_iter().map(|(_, r)| r).collect();
        self.known.retain_present(&still_present);

        Ok(true)
    }

    async fn main_branch_pseudo_request(&self, now: DateTime<Utc>) -> Result<Option<(u8, PullRequest)>> {
        if !self.config.main_branch_pseudo_request {
            return Ok(None);
        }

        let branch = match self.client.get_branch(&self.config.pr_branch).await? {
            Some(branch) => branch,
            None => {
                log::warn!(
                    "main-branch pseudo-request enabled but branch {} not found",
                    self.config.pr_branch
                );
                return Ok(None);
            }
        };

        let pr = PullRequest {
            number: self.config.pr_branch.clone(),
            sha: branch.commit.sha,
            created: now,
            updated: None,
            reviewed: true,
            tested: false,
            success: false,
            fetched: now,
        };

        Ok(Some((categorize::Category::NotTested.priority(), pr)))
    }
}

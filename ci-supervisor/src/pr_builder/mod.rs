mod scheduler;

use crate::broker::{Args, Broker, ParentMessage, Reply};
use crate::config::Config;
use crate::fetcher::Fetcher;
use crate::handler::Handler;
use crate::metrics::{MetricsCollector, MetricsCollectorConfig};
use crate::worker::{poll_parent, WorkerCore, PARENT_POLL_TIMEOUT};
use ci_telemetry::metrics::{Metric, MetricSender};
use ci_telemetry::UdpEmitter;
use hosting_client::model::PullRequest;
use hosting_client::HostingClient;
use scheduler::PriorityQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const TICK: Duration = Duration::from_secs(5);
const RESULTS_CHANNEL_CAPACITY: usize = 64;

struct RunningHandler {
    priority: u8,
    request: PullRequest,
}

/// Owns exactly one fetcher, one metrics collector, and at most one
/// handler at a time. Implements the 5-second decision tick: launch the
/// next queued request when idle, let an in-flight handler run to
/// completion unless a strictly higher-priority request arrives, in which
/// case the running handler is shut down and its request pushed back onto
/// the queue for relaunch.
pub struct PrBuilderParent {
    core: WorkerCore,
    client: HostingClient,
    config: Arc<Config>,
    metrics: MetricSender,
    results_rx: mpsc::Receiver<(u8, PullRequest)>,
    queue: PriorityQueue,
    current: Option<RunningHandler>,
}

impl PrBuilderParent {
    pub fn new(
        mut broker: Broker,
        client: HostingClient,
        config: Arc<Config>,
        metrics: MetricSender,
        metrics_intake: mpsc::UnboundedReceiver<Metric>,
        emitter: UdpEmitter,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::channel(RESULTS_CHANNEL_CAPACITY);
        spawn_fetcher(&mut broker, client.clone(), config.clone(), metrics.clone(), results_tx);

        let metrics_config = MetricsCollectorConfig {
            metric_path_prefix: config.monalisa_metric_path.clone(),
            hostname: hostname(),
            worker_index: config.worker_index,
            ci_name: config.ci_name.clone(),
        };
        let (metrics_down, metrics_endpoint) = broker.create_pair("metrics");
        let metrics_broker = Broker::new(
            metrics_endpoint.broker_id.clone(),
            Some(metrics_endpoint.parent_tx.clone()),
        );
        let collector = MetricsCollector::new(metrics_broker, metrics_intake, emitter, metrics_config);
        let metrics_join = tokio::spawn(collector.run(metrics_endpoint.rx));
        broker.register("metrics", metrics_down, metrics_join);

        Self {
            core: WorkerCore::new("pr_builder", broker),
            client,
            config,
            metrics,
            results_rx,
            queue: PriorityQueue::new(),
            current: None,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<ParentMessage>) {
        self.core.set_started();

        loop {
            if self.core.shutdown {
                break;
            }

            tokio::select! {
                msg = poll_parent(&mut rx, PARENT_POLL_TIMEOUT) => {
                    if let Some(msg) = msg {
                        if self.dispatch(msg).await {
                            break;
                        }
                    }
                }
                result = self.results_rx.recv() => {
                    match result {
                        Some((priority, request)) => self.queue.push(priority, request),
                        None => log::warn!("pr_builder: fetcher results channel closed"),
                    }
                }
                _ = tokio::time::sleep(TICK) => {}
            }

            if self.core.shutdown {
                break;
            }

            self.reap_finished_handler();
            self.restart_fetcher_if_dead();
            self.tick().await;
        }

        self.core.handle_shutdown().await;
    }

    async fn dispatch(&mut self, msg: ParentMessage) -> bool {
        match msg {
            ParentMessage::Tell(env) if env.message == "shutdown" => {
                self.core.shutdown = true;
                true
            }
            ParentMessage::Ask(env, reply_tx) if env.message == "shutdown" => {
                self.core.shutdown = true;
                let _ = reply_tx.send(Reply::ok(self.core.name.clone(), Args::Null));
                true
            }
            ParentMessage::Tell(env) => {
                let _ = self.core.dispatch_common(&env.message).await;
                false
            }
            ParentMessage::Ask(env, reply_tx) => {
                let payload = self.core.dispatch_common(&env.message).await.unwrap_or(Args::Null);
                let _ = reply_tx.send(Reply::ok(self.core.name.clone(), payload));
                false
            }
        }
    }

    fn reap_finished_handler(&mut self) {
        if self.core.broker.is_child_alive("handler") == Some(false) {
            self.core.broker.remove("handler");
            self.current = None;
        }
    }

    fn restart_fetcher_if_dead(&mut self) {
        if self.core.shutdown {
            return;
        }
        if self.core.broker.is_child_alive("fetcher") == Some(false) {
            log::warn!("pr_builder: fetcher died, restarting");
            self.core.broker.remove("fetcher");
            let (results_tx, results_rx) = mpsc::channel(RESULTS_CHANNEL_CAPACITY);
            self.results_rx = results_rx;
            spawn_fetcher(
                &mut self.core.broker,
                self.client.clone(),
                self.config.clone(),
                self.metrics.clone(),
                results_tx,
            );
        }
    }

    /// Idle with work queued launches it; a running handler continues
    /// unless the queue's head strictly outranks it (lower priority
    /// number), in which case it is preempted.
    async fn tick(&mut self) {
        match (&self.current, self.queue.peek()) {
            (None, Some(_)) => self.launch_next().await,
            (Some(running), Some((priority, _))) if *priority < running.priority => {
                self.preempt_and_relaunch().await;
            }
            _ => {}
        }
    }

    async fn launch_next(&mut self) {
        let Some((priority, request)) = self.queue.pop() else {
            return;
        };

        let (down_tx, endpoint) = self.core.broker.create_pair("handler");
        let child_broker = Broker::new(endpoint.broker_id.clone(), Some(endpoint.parent_tx.clone()));
        let handler = Handler::new(
            child_broker,
            self.client.clone(),
            self.config.clone(),
            self.metrics.clone(),
            request.clone(),
        );
        let join = tokio::spawn(handler.run(endpoint.rx));
        self.core.broker.register("handler", down_tx, join);

        self.current = Some(RunningHandler { priority, request });
    }

    async fn preempt_and_relaunch(&mut self) {
        let Some(running) = self.current.take() else {
            return;
        };

        log::info!(
            "pr_builder: preempting handler for pr {} (priority {})",
            running.request.number,
            running.priority
        );
        let _ = self.core.broker.send_child("handler", "shutdown", Args::Null).await;
        self.core.broker.join_child("handler", Duration::from_secs(30)).await;
        self.core.broker.remove("handler");

        self.queue.push(running.priority, running.request);
        self.launch_next().await;
    }
}

fn spawn_fetcher(
    broker: &mut Broker,
    client: HostingClient,
    config: Arc<Config>,
    metrics: MetricSender,
    results_tx: mpsc::Sender<(u8, PullRequest)>,
) {
    let (down_tx, endpoint) = broker.create_pair("fetcher");
    let child_broker = Broker::new(endpoint.broker_id.clone(), Some(endpoint.parent_tx.clone()));
    let fetcher = Fetcher::new(child_broker, client, config, metrics, results_tx);
    let join = tokio::spawn(fetcher.run(endpoint.rx));
    broker.register("fetcher", down_tx, join);
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

use crate::broker::{Args, Broker, ParentMessage};
use crate::worker::{poll_parent, WorkerCore, PARENT_POLL_TIMEOUT};
use ci_telemetry::metrics::{path_for, Metric};
use ci_telemetry::UdpEmitter;
use tokio::sync::mpsc::UnboundedReceiver;

pub struct MetricsCollectorConfig {
    pub metric_path_prefix: String,
    pub hostname: String,
    pub worker_index: usize,
    pub ci_name: Option<String>,
}

/// Drains the process-wide metric intake channel and forwards every
/// measurement to the monitoring-endpoint emitter, stamped with this
/// instance's metric path. Owns nothing heavy of its own: the intake
/// channel's sending half is cloned out to every worker that needs to
/// emit a metric at construction time, not reached for through a global.
pub struct MetricsCollector {
    core: WorkerCore,
    intake: UnboundedReceiver<Metric>,
    emitter: UdpEmitter,
    path: String,
}

impl MetricsCollector {
    pub fn new(
        broker: Broker,
        intake: UnboundedReceiver<Metric>,
        emitter: UdpEmitter,
        config: MetricsCollectorConfig,
    ) -> Self {
        let path = path_for(
            &config.metric_path_prefix,
            &config.hostname,
            config.worker_index,
            config.ci_name.as_deref(),
        );
        Self {
            core: WorkerCore::new("metrics", broker),
            intake,
            emitter,
            path,
        }
    }

    pub async fn run(mut self, mut rx: tokio::sync::mpsc::Receiver<ParentMessage>) {
        self.core.set_started();

        loop {
            if self.core.shutdown {
                break;
            }

            tokio::select! {
                msg = poll_parent(&mut rx, PARENT_POLL_TIMEOUT) => {
                    if let Some(msg) = msg {
                        self.dispatch(msg).await;
                    }
                }
                metric = self.intake.recv() => {
                    match metric {
                        Some(metric) => self.forward(metric).await,
                        None => break,
                    }
                }
            }
        }

        self.drain_remaining().await;
    }

    async fn dispatch(&mut self, msg: ParentMessage) {
        match msg {
            ParentMessage::Tell(env) => {
                let _ = self.core.dispatch_common(&env.message).await;
            }
            ParentMessage::Ask(env, reply_tx) => {
                let payload = self
                    .core
                    .dispatch_common(&env.message)
                    .await
                    .unwrap_or(Args::Null);
                let _ = reply_tx.send(crate::broker::Reply::ok(self.core.name.clone(), payload));
            }
        }
    }

    async fn forward(&self, metric: Metric) {
        if let Err(e) = self.emitter.send(&self.path, &metric).await {
            log::warn!("failed to forward metric {}: {}", metric.name, e);
        }
    }

    async fn drain_remaining(&mut self) {
        while let Ok(metric) = self.intake.try_recv() {
            self.forward(metric).await;
        }
    }
}

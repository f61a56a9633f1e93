use crate::broker::{Args, Broker, Envelope, ParentMessage, Reply};
use crate::config::Config;
use crate::pr_builder::PrBuilderParent;
use crate::worker::{poll_parent, WorkerCore, PARENT_POLL_TIMEOUT};
use hosting_client::HostingClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const LIVENESS_POLL: Duration = Duration::from_secs(10);
const FORCED_ROTATION_POLLS: u32 = 20;

/// The root of the worker tree. Currently cycles a single top-level task
/// (the PR-builder parent); kept as a name table rather than a fixed
/// field so a second top-level task only needs appending here, not a
/// rewrite of the rotation logic.
const TASK_NAMES: &[&str] = &["pr_builder"];

/// Supervises the top-level task list: restarts a task if it dies, and
/// forces a fresh restart every `FORCED_ROTATION_POLLS` liveness checks
/// (about 200s) even if the task is healthy, bounding how long any single
/// run of a top-level task's accumulated state (caches, known-request
/// tables) goes unrefreshed. Also answers the operator verbs the HTTP
/// control surface proxies.
pub struct Supervisor {
    core: WorkerCore,
    client: HostingClient,
    config: Arc<Config>,
    task_index: usize,
}

impl Supervisor {
    pub fn new(client: HostingClient, config: Arc<Config>) -> Self {
        Self {
            core: WorkerCore::new("supervisor", Broker::new("supervisor", None)),
            client,
            config,
            task_index: 0,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<ParentMessage>) {
        self.core.set_started();
        self.spawn_current_task().await;

        let mut polls_since_rotation = 0u32;

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

            tokio::time::sleep(LIVENESS_POLL).await;
            polls_since_rotation += 1;

            let name = self.current_task_name();
            if self.core.broker.is_child_alive(name) == Some(false) {
                log::warn!("supervisor: task {} died, restarting", name);
                self.core.broker.remove(name);
                self.spawn_current_task().await;
                polls_since_rotation = 0;
                continue;
            }

            if polls_since_rotation >= FORCED_ROTATION_POLLS {
                log::info!("supervisor: forced rotation of task {}", name);
                self.rotate().await;
                polls_since_rotation = 0;
            }
        }

        self.core.handle_shutdown().await;
    }

    fn current_task_name(&self) -> &'static str {
        TASK_NAMES[self.task_index % TASK_NAMES.len()]
    }

    async fn spawn_current_task(&mut self) {
        match self.current_task_name() {
            "pr_builder" => self.spawn_pr_builder().await,
            other => log::error!("supervisor: unknown task {}", other),
        }
    }

    async fn spawn_pr_builder(&mut self) {
        let (down_tx, endpoint) = self.core.broker.create_pair("pr_builder");
        let child_broker = Broker::new(endpoint.broker_id.clone(), Some(endpoint.parent_tx.clone()));

        let (metrics_tx, metrics_rx) = tokio::sync::mpsc::unbounded_channel();
        let destination = format!("{}:{}", self.config.monalisa_host, self.config.monalisa_port);
        let emitter = match ci_telemetry::UdpEmitter::connect(destination).await {
            Ok(emitter) => emitter,
            Err(e) => {
                log::error!("supervisor: failed to connect metrics emitter: {}", e);
                return;
            }
        };

        let parent = PrBuilderParent::new(
            child_broker,
            self.client.clone(),
            self.config.clone(),
            metrics_tx,
            metrics_rx,
            emitter,
        );
        let join = tokio::spawn(parent.run(endpoint.rx));
        self.core.broker.register("pr_builder", down_tx, join);
    }

    async fn rotate(&mut self) {
        let name = self.current_task_name();
        let _ = self.core.broker.send_child(name, "shutdown", Args::Null).await;
        self.core.broker.join_child(name, Duration::from_secs(30)).await;
        self.core.broker.remove(name);

        self.task_index = (self.task_index + 1) % TASK_NAMES.len();
        self.spawn_current_task().await;
    }

    async fn dispatch(&mut self, msg: ParentMessage) -> bool {
        match msg {
            ParentMessage::Tell(env) => {
                let is_shutdown = env.message == "shutdown";
                self.handle_verb(env).await;
                is_shutdown
            }
            ParentMessage::Ask(env, reply_tx) => {
                let is_shutdown = env.message == "shutdown";
                let reply = self.handle_verb(env).await;
                let _ = reply_tx.send(reply);
                is_shutdown
            }
        }
    }

    /// Services the operator verbs the HTTP control surface proxies
    /// (`available_tasks`, `current_task`, `current_task_processes`,
    /// `current_task_shutdown`, `current_task_kill_proc`), falling back to
    /// `WorkerCore::dispatch_common` for the two universal verbs.
    async fn handle_verb(&mut self, env: Envelope) -> Reply {
        let sender = self.core.name.clone();
        match env.message.as_str() {
            "shutdown" => {
                self.core.shutdown = true;
                Reply::ok(sender, Args::Null)
            }
            "available_tasks" => Reply::ok(sender, serde_json::json!(TASK_NAMES)),
            "current_task" => Reply::ok(sender, serde_json::json!(self.current_task_name())),
            "current_task_processes" => {
                let name = self.current_task_name();
                let reply = self
                    .core
                    .broker
                    .fetch_child(name, "list_processes", Args::Null, Duration::from_secs(5))
                    .await;
                Reply::ok(sender, reply.payload)
            }
            "current_task_shutdown" => {
                let name = self.current_task_name();
                let _ = self.core.broker.send_child(name, "shutdown", Args::Null).await;
                Reply::ok(sender, Args::Null)
            }
            "current_task_kill_proc" => {
                let pid = env.args.get("pid").and_then(|v| v.as_u64());
                match pid {
                    Some(pid) if pid as u32 == self.core.pid => {
                        Reply::err(sender, "refusing to kill the supervisor itself")
                    }
                    Some(_) => {
                        let name = self.current_task_name();
                        self.core.broker.terminate_child(name);
                        Reply::ok(sender, Args::Null)
                    }
                    None => Reply::err(sender, "missing pid argument"),
                }
            }
            verb => match self.core.dispatch_common(verb).await {
                Some(payload) => Reply::ok(sender, payload),
                None => Reply::err(sender, format!("unknown verb: {}", verb)),
            },
        }
    }
}

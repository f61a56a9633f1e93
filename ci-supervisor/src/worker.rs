use crate::broker::{Args, Broker, Envelope, ParentMessage, Reply};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;

/// Default bound on a single parent-message receive inside a worker's own
/// event loop; every suspension point composes with this so no worker ever
/// blocks longer than this waiting to notice `shutdown`.
pub const PARENT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// How often `wait_for_children` re-checks liveness while still servicing
/// parent messages.
pub const CHILD_LIVENESS_POLL: Duration = Duration::from_secs(5);

/// Shared bookkeeping every worker carries: identity, lifecycle
/// timestamps, shutdown flags and its broker. Concrete workers embed this
/// by composition and drive their own `run()` loop around it; the two
/// universal verbs (`shutdown`, `list_processes`) are handled through
/// `WorkerCore::dispatch_common`, so each worker only needs to handle the
/// verbs specific to it.
pub struct WorkerCore {
    pub name: String,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub shutdown: bool,
    pub broker: Broker,
}

impl WorkerCore {
    pub fn new(name: impl Into<String>, broker: Broker) -> Self {
        Self {
            name: name.into(),
            pid: std::process::id(),
            created_at: Utc::now(),
            started_at: None,
            shutdown: false,
            broker,
        }
    }

    pub fn set_started(&mut self) {
        self.started_at = Some(Utc::now());
    }

    /// Forwards `shutdown` to every child, waits for them to exit (bounded
    /// by their own exit, not by a fixed deadline here), then marks this
    /// worker as shutting down. Call sites still need to actually break
    /// their own run loop afterwards.
    pub async fn handle_shutdown(&mut self) {
        for name in self.broker.child_names() {
            let _ = self.broker.send_child(&name, "shutdown", Args::Null).await;
        }
        self.wait_for_children_quiescent(CHILD_LIVENESS_POLL).await;
        self.shutdown = true;
    }

    async fn wait_for_children_quiescent(&mut self, check_every: Duration) {
        loop {
            let names = self.broker.child_names();
            if names
                .iter()
                .all(|n| self.broker.is_child_alive(n) != Some(true))
            {
                return;
            }
            tokio::time::sleep(check_every).await;
        }
    }

    /// Builds the `{pid, name, child_processes}` tree required by
    /// `list_processes`, recursing into children via `fetch_child`.
    pub async fn list_processes(&self) -> Args {
        let mut child_processes = Vec::new();
        for name in self.broker.child_names() {
            let reply = self
                .broker
                .fetch_child(&name, "list_processes", Args::Null, Duration::from_secs(3))
                .await;
            if reply.is_ok() {
                child_processes.push(reply.payload);
            }
        }

        serde_json::json!({
            "pid": self.pid,
            "name": self.name,
            "child_processes": child_processes,
        })
    }

    /// Handles the two verbs every worker must answer the same way.
    /// Returns `None` for anything else so the caller can fall through to
    /// its own dispatch.
    pub async fn dispatch_common(&mut self, verb: &str) -> Option<Args> {
        match verb {
            "shutdown" => {
                self.handle_shutdown().await;
                Some(Args::Null)
            }
            "list_processes" => Some(self.list_processes().await),
            _ => None,
        }
    }

    /// Polls child liveness on an interval while still servicing parent
    /// messages that arrive in the meantime (via `dispatch`), returning
    /// once every child named in `children` has exited.
    pub async fn wait_for_child_tasks<F>(
        &mut self,
        rx: &mut mpsc::Receiver<ParentMessage>,
        children: &[String],
        check_every: Duration,
        mut dispatch: F,
    ) where
        F: FnMut(&mut WorkerCore, Envelope) -> Args,
    {
        loop {
            if children
                .iter()
                .all(|n| self.broker.is_child_alive(n) != Some(true))
            {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(check_every) => {}
                msg = rx.recv() => {
                    match msg {
                        Some(ParentMessage::Tell(env)) => { dispatch(self, env); }
                        Some(ParentMessage::Ask(env, reply_tx)) => {
                            let sender = self.name.clone();
                            let payload = dispatch(self, env);
                            let _ = reply_tx.send(Reply::ok(sender, payload));
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

/// Receives at most one parent message within `timeout`, or `None` if the
/// channel is idle or closed. Every worker's event loop wraps this instead
/// of calling `rx.recv()` directly, so no worker ever blocks on its parent
/// channel for longer than `timeout`.
pub async fn poll_parent(
    rx: &mut mpsc::Receiver<ParentMessage>,
    timeout: Duration,
) -> Option<ParentMessage> {
    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(msg)) => Some(msg),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;

    #[tokio::test]
    async fn list_processes_reports_pid_and_name() {
        let core = WorkerCore::new("root", Broker::new("root", None));
        let payload = core.list_processes().await;
        assert_eq!(payload["name"], "root");
        assert_eq!(payload["child_processes"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn shutdown_with_no_children_completes_immediately() {
        let mut core = WorkerCore::new("root", Broker::new("root", None));
        core.handle_shutdown().await;
        assert!(core.shutdown);
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub type Args = serde_json::Value;

/// A message carried on a channel pair, signed with the sender's broker id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: String,
    pub message: String,
    pub args: Args,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, message: impl Into<String>, args: Args) -> Self {
        Self {
            sender: sender.into(),
            message: message.into(),
            args,
        }
    }
}

/// Reply to a `fetch_child` call. Carries `exitcode: 0` on success and `1`
/// with a `content` string on timeout or a missing child.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reply {
    pub sender: String,
    pub exitcode: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub payload: Args,
}

impl Reply {
    pub fn ok(sender: impl Into<String>, payload: Args) -> Self {
        Self {
            sender: sender.into(),
            exitcode: 0,
            content: None,
            payload,
        }
    }

    pub fn err(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            exitcode: 1,
            content: Some(content.into()),
            payload: Args::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.exitcode == 0
    }
}

/// What arrives on a worker's parent-facing receiver: either a
/// fire-and-forget instruction, or a request expecting a reply.
pub enum ParentMessage {
    Tell(Envelope),
    Ask(Envelope, oneshot::Sender<Reply>),
}

impl ParentMessage {
    pub fn envelope(&self) -> &Envelope {
        match self {
            ParentMessage::Tell(e) => e,
            ParentMessage::Ask(e, _) => e,
        }
    }
}

/// The endpoint handed to a freshly created child: its inbound queue from
/// the parent, and the upward sender it uses for `send_parent`.
pub struct ChildEndpoint {
    pub rx: mpsc::Receiver<ParentMessage>,
    pub parent_tx: mpsc::Sender<Envelope>,
    pub broker_id: String,
}

/// A live handle to a spawned child, as tracked by the parent's broker.
struct ChildHandle {
    down_tx: mpsc::Sender<ParentMessage>,
    join: JoinHandle<()>,
}

/// Owns the named channel pairs to this worker's children, plus the
/// (optional) pair to its own parent. `create_pair` mints a new pair;
/// `send_child`/`fetch_child` route by child name; `send_parent` is a
/// silent no-op at the root, where there is no parent pair.
pub struct Broker {
    id: String,
    children: HashMap<String, ChildHandle>,
    upward_tx: mpsc::Sender<Envelope>,
    upward_rx: mpsc::Receiver<Envelope>,
    parent_tx: Option<mpsc::Sender<Envelope>>,
}

impl Broker {
    pub fn new(id: impl Into<String>, parent_tx: Option<mpsc::Sender<Envelope>>) -> Self {
        let (upward_tx, upward_rx) = mpsc::channel(256);
        Self {
            id: id.into(),
            children: HashMap::new(),
            upward_tx,
            upward_rx,
            parent_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Mints a new channel pair for a child named `name`. The returned
    /// `ChildEndpoint` is handed to the child's constructor; the sending
    /// half is kept here until `register` is called once the child has
    /// actually been spawned.
    pub fn create_pair(&self, name: &str) -> (mpsc::Sender<ParentMessage>, ChildEndpoint) {
        let (down_tx, down_rx) = mpsc::channel(64);
        let endpoint = ChildEndpoint {
            rx: down_rx,
            parent_tx: self.upward_tx.clone(),
            broker_id: format!("{}/{}", self.id, name),
        };
        (down_tx, endpoint)
    }

    /// Records a spawned child under `name`, replacing any prior entry of
    /// the same name (the caller is expected to have already reaped the
    /// old one via `remove`).
    pub fn register(&mut self, name: &str, down_tx: mpsc::Sender<ParentMessage>, join: JoinHandle<()>) {
        self.children
            .insert(name.to_string(), ChildHandle { down_tx, join });
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.children.remove(name).is_some()
    }

    pub fn child_names(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    pub fn is_child_alive(&self, name: &str) -> Option<bool> {
        self.children.get(name).map(|h| !h.join.is_finished())
    }

    pub fn terminate_child(&self, name: &str) {
        if let Some(child) = self.children.get(name) {
            child.join.abort();
        }
    }

    pub async fn join_child(&mut self, name: &str, timeout: Duration) -> bool {
        let Some(child) = self.children.get_mut(name) else {
            return true;
        };
        tokio::time::timeout(timeout, &mut child.join).await.is_ok()
    }

    pub async fn send_child(&self, name: &str, verb: &str, args: Args) -> Result<(), String> {
        let Some(child) = self.children.get(name) else {
            return Err(format!("{}: no such child", name));
        };
        let env = Envelope::new(self.id.clone(), verb, args);
        child
            .down_tx
            .send(ParentMessage::Tell(env))
            .await
            .map_err(|_| format!("{}: channel closed", name))
    }

    pub async fn fetch_child(&self, name: &str, verb: &str, args: Args, timeout: Duration) -> Reply {
        let Some(child) = self.children.get(name) else {
            return Reply::err(&self.id, format!("{}: no such child", name));
        };

        let (tx, rx) = oneshot::channel();
        let env = Envelope::new(self.id.clone(), verb, args);
        if child.down_tx.send(ParentMessage::Ask(env, tx)).await.is_err() {
            return Reply::err(&self.id, format!("{}: channel closed", name));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            _ => Reply::err(&self.id, "recv timed out"),
        }
    }

    /// Drains one message sent upward by any child (non-blocking); used by
    /// a parent that wants to observe `send_parent` traffic (e.g. analytics
    /// escalation) without a dedicated channel per concern.
    pub async fn try_recv_from_child(&mut self) -> Option<Envelope> {
        self.upward_rx.try_recv().ok()
    }

    pub async fn send_parent(&self, verb: &str, args: Args) {
        if let Some(tx) = &self.parent_tx {
            let _ = tx.send(Envelope::new(self.id.clone(), verb, args)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_child_reports_no_such_child() {
        let broker = Broker::new("root", None);
        let reply = broker
            .fetch_child("ghost", "ping", Args::Null, Duration::from_millis(50))
            .await;
        assert_eq!(reply.exitcode, 1);
        assert_eq!(reply.content.as_deref(), Some("ghost: no such child"));
    }

    #[tokio::test]
    async fn send_child_reports_no_such_child() {
        let broker = Broker::new("root", None);
        let err = broker.send_child("ghost", "ping", Args::Null).await.unwrap_err();
        assert_eq!(err, "ghost: no such child");
    }

    #[tokio::test]
    async fn fetch_child_times_out_if_no_reply() {
        let mut broker = Broker::new("root", None);
        let (down_tx, endpoint) = broker.create_pair("silent");
        // Hold the receiver open without ever answering asks.
        let join = tokio::spawn(async move {
            let mut rx = endpoint.rx;
            // Keep the channel alive for the duration of the test without
            // replying to anything sent on it.
            while rx.recv().await.is_some() {}
        });
        broker.register("silent", down_tx, join);

        let reply = broker
            .fetch_child("silent", "ping", Args::Null, Duration::from_millis(50))
            .await;
        assert_eq!(reply.exitcode, 1);
        assert_eq!(reply.content.as_deref(), Some("recv timed out"));
    }

    #[tokio::test]
    async fn fetch_child_round_trips_a_reply() {
        let mut broker = Broker::new("root", None);
        let (down_tx, endpoint) = broker.create_pair("echo");
        let join = tokio::spawn(async move {
            let mut rx = endpoint.rx;
            if let Some(ParentMessage::Ask(env, reply_tx)) = rx.recv().await {
                let _ = reply_tx.send(Reply::ok(env.sender, serde_json::json!({"pong": true})));
            }
        });
        broker.register("echo", down_tx, join);

        let reply = broker
            .fetch_child("echo", "ping", Args::Null, Duration::from_secs(1))
            .await;
        assert!(reply.is_ok());
        assert_eq!(reply.payload, serde_json::json!({"pong": true}));
    }

    #[test]
    fn is_child_alive_is_none_for_unknown_child() {
        let broker = Broker::new("root", None);
        assert_eq!(broker.is_child_alive("ghost"), None);
    }

    #[tokio::test]
    async fn child_names_reflects_registered_children() {
        let mut broker = Broker::new("root", None);
        let (down_tx, endpoint) = broker.create_pair("a");
        let join = tokio::spawn(async move {
            let _rx = endpoint.rx;
        });
        broker.register("a", down_tx, join);
        assert_eq!(broker.child_names(), vec!["a".to_string()]);
        assert!(broker.remove("a"));
        assert!(broker.child_names().is_empty());
    }
}

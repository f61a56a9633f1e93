use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;

/// A single named measurement, queued by any worker and drained by the
/// metrics collector for delivery to the monitoring endpoint.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
}

pub type MetricSender = UnboundedSender<Metric>;

/// Queues a measurement without blocking the caller. The collector may be
/// mid-restart; in that case the send is simply lost rather than stalling
/// the worker that observed it.
pub fn emit(tx: &MetricSender, name: impl Into<String>, value: f64) {
    let _ = tx.send(Metric {
        name: name.into(),
        value,
    });
}

/// Builds the `<category>.<subcategory>_Nodes/<hostname>-<worker-index>[-<ci_name>]`
/// path the monitoring endpoint groups datagrams under. `metric_path_prefix`
/// is the already-configured `<category>.<subcategory>` portion (the
/// `MONALISA_METRIC_PATH` setting); this function only appends the
/// per-instance `_Nodes/...` suffix.
pub fn path_for(
    metric_path_prefix: &str,
    hostname: &str,
    worker_index: usize,
    ci_name: Option<&str>,
) -> String {
    match ci_name {
        Some(ci_name) => format!(
            "{}_Nodes/{}-{}-{}",
            metric_path_prefix, hostname, worker_index, ci_name
        ),
        None => format!(
            "{}_Nodes/{}-{}",
            metric_path_prefix, hostname, worker_index
        ),
    }
}

/// Sends metric datagrams of the form `"<path> <name> <value>"` to a fixed
/// `host:port` destination over UDP, matching the monitoring-endpoint
/// emitter contract. UDP is fire-and-forget by design here: a dropped
/// datagram should never back-pressure the collector's drain loop.
pub struct UdpEmitter {
    socket: UdpSocket,
    destination: String,
}

impl UdpEmitter {
    pub async fn connect(destination: impl Into<String>) -> Result<Self> {
        let destination = destination.into();
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding ephemeral UDP socket for metrics emission")?;
        socket
            .connect(&destination)
            .await
            .with_context(|| format!("connecting metrics socket to {}", destination))?;
        Ok(Self {
            socket,
            destination,
        })
    }

    pub async fn send(&self, path: &str, metric: &Metric) -> Result<()> {
        let datagram = format!("{} {} {}", path, metric.name, metric.value);
        self.socket
            .send(datagram.as_bytes())
            .await
            .with_context(|| format!("sending metric datagram to {}", self.destination))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_includes_ci_name_when_present() {
        let path = path_for("build.linux", "host01", 3, Some("alice"));
        assert_eq!(path, "build.linux_Nodes/host01-3-alice");
    }

    #[test]
    fn path_omits_ci_name_when_absent() {
        let path = path_for("build.linux", "host01", 3, None);
        assert_eq!(path, "build.linux_Nodes/host01-3");
    }

    #[tokio::test]
    async fn udp_emitter_round_trips_a_datagram() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let emitter = UdpEmitter::connect(addr.to_string()).await.unwrap();
        emitter
            .send(
                "build.linux_Nodes/host01-0",
                &Metric {
                    name: "number_prs".to_string(),
                    value: 7.0,
                },
            )
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        let (n, _) = listener.recv_from(&mut buf).await.unwrap();
        let received = String::from_utf8_lossy(&buf[..n]);
        assert_eq!(received, "build.linux_Nodes/host01-0 number_prs 7");
    }
}

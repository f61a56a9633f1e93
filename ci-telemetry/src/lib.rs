pub mod logging;
pub mod metrics;

pub use logging::{install as install_logger, LogRecord};
pub use metrics::{Metric, MetricSender, UdpEmitter};

//! Wire model for the OpenTelemetry JSON encoding, covering the subset of
//! the logs and metrics signals this forwarder emits, plus the request
//! builder that accumulates log records under a single resource identity.

mod builder;
mod logs;
mod metrics;
mod value;

pub use builder::{ContainerIdentity, LogsRequestBuilder};
pub use logs::{LogRecord, LogsData, Resource, ResourceLogs, ScopeLogs};
pub use metrics::{
    Gauge, InstrumentationScope, Metric, MetricsData, NumberDataPoint, ResourceMetrics,
    ScopeMetrics,
};
pub use value::{AnyValue, ArrayValue, KeyValue, KeyValueList};

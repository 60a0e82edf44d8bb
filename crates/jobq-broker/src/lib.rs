pub mod api;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod metrics;

pub use broker::Broker;
pub use config::{BrokerConfig, StorageBackend};
pub use dispatcher::{DispatchError, Dispatcher, EnqueueRequest, Submission};
pub use metrics::DispatchMetrics;

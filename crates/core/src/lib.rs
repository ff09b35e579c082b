pub mod backoff;
pub mod cancel;
pub mod classify;
pub mod clock;
pub mod config;
pub mod counters;
pub mod device;
pub mod error;
pub mod identifier;
pub mod ids;
pub mod merge;
pub mod sighting;

pub use backoff::BackoffPolicy;
pub use cancel::CancelToken;
pub use classify::{Classification, ErrorClass, ErrorClassifier, SqlStateClassifier, SqlStateError};
pub use clock::Timestamp;
pub use config::{LifecycleConfig, RetryConfig};
pub use counters::{FacadeMetrics, MetricsSink, NoopMetrics, RetryCounters};
pub use device::DeviceRecord;
pub use error::CoreError;
pub use identifier::{DeviceIdentifier, StrongIdentifiers};
pub use ids::*;
pub use merge::{ColumnRule, MergeRule};
pub use sighting::{
    ExpiredSighting, Fingerprint, NetworkSighting, SightingEvent, SightingObservation, SightingStatus,
    SubnetPolicy,
};

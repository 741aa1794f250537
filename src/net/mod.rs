//! Wireless link supervision and delivery to the Pushgateway.
//!
//! The reporter is the only component that performs network I/O. It consults
//! the connectivity manager before every attempt and never blocks sampling.

pub mod connectivity;
pub mod exposition;
pub mod reporter;
pub mod retry;
pub mod transport;

// Re-export commonly used items
pub use connectivity::{
    ConnectivityHandle, ConnectivityManager, ConnectivityState, HostLink, StaticLink,
    WirelessLink,
};
pub use exposition::{Exposition, CONTENT_TYPE};
pub use reporter::{DeliveryOutcome, MetricsReporter};
pub use retry::RetryPolicy;
pub use transport::{HttpTransport, LoggingTransport, PushTransport};

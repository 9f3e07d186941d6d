//! Monitor endpoints and the registry that authenticates them.

mod endpoint;
mod registry;

pub use endpoint::{ChannelEndpoint, DeliveryError, EventKind, MonitorEvent, MonitorId, PushTarget};
pub use registry::{BroadcastOutcome, MonitorError, MonitorRegistry, DEFAULT_MAX_MONITORS};

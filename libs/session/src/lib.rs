//! Multi-tenant WhatsApp session lifecycle.
//!
//! The [`SessionRegistry`] owns one state machine per tenant and is the only
//! consumer of transport events; everything downstream (HTTP surface,
//! dispatcher, UI push) observes sessions through the registry or the event
//! bridge, never through transport internals.

mod hosted;
mod mock;
mod pairing;
mod registry;
mod tracker;
mod transport;

pub use hosted::HostedGatewayTransport;
pub use mock::{MockTransport, SentText};
pub use pairing::{PairingCoordinator, PAIRING_TTL};
pub use registry::{SessionRegistry, SessionStatus, CONNECT_TIMEOUT};
pub use tracker::DeliveryTracker;
pub use transport::{DeliveryHandle, SharedTransport, TransportAdapter, TransportEvent};

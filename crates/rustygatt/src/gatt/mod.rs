//! GATT (Generic Attribute Profile) server
//!
//! Services are registered with the [`ServiceRegistry`] before the server
//! starts. Each connected peer gets a [`Session`]; inbound PDUs go through the
//! [`RequestDispatcher`] and outbound notifications through the session's
//! [`NotificationQueue`].

pub mod dispatcher;
pub mod notify;
pub mod registry;
pub mod server;
pub mod session;
pub mod types;

#[cfg(test)]
mod tests;

pub use dispatcher::{DispatchOutcome, RequestDispatcher};
pub use notify::{NotificationQueue, Outbound, OutboundKind, PendingIndication, PumpReport};
pub use registry::{Attribute, AttributeKind, CharacteristicEntry, ServiceRange, ServiceRegistry};
pub use server::{EventSender, GattApplication, GattServer, NoopApplication};
pub use session::{Session, SessionManager};
pub use types::*;

//! The upstream gateway link: one persistent authenticated WebSocket
//! per process, with request correlation layered on top.
//!
//! [`connection::ConnectionManager`] exclusively owns the transport;
//! all outbound traffic goes through [`correlator::RequestCorrelator`]
//! via a [`connection::GatewayHandle`].

pub mod connection;
pub mod correlator;
pub mod identity;
pub mod protocol;

pub use connection::{ConnectionManager, ConnectionState, GatewayHandle, HealthSnapshot};
pub use correlator::RequestCorrelator;
pub use identity::DeviceIdentity;
pub use protocol::{ClientFrame, RemoteErrorBody, ServerFrame, WireEvent};

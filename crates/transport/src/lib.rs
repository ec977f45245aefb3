//! HTTP server network transport
//!
//! This crate adapts the raw network layer ([`network`]) to the narrow
//! capability interfaces an HTTP engine consumes:
//!
//! - [`ServerTransport`] owns the listening endpoint and reports every
//!   accepted connection to a [`NewConnectionDelegate`].
//! - [`Connection`] is what the engine holds for each peer: it sends bytes,
//!   breaks the connection and registers the delegates that receive inbound
//!   data and the broken notification.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use transport::{Connection, HttpServerNetworkTransport, ServerTransport};
//!
//! let mut server = HttpServerNetworkTransport::new();
//! server.bind_network(
//!     0,
//!     Arc::new(|connection: Arc<dyn Connection>| {
//!         let echo = Arc::clone(&connection);
//!         connection.set_data_received_delegate(Box::new(move |data: Vec<u8>| echo.send_data(data)));
//!     }),
//! )?;
//! println!("listening on port {}", server.bound_port());
//! # Ok::<(), eyre::Error>(())
//! ```
mod adapter;
mod config;
mod connection;
mod server;

#[cfg(test)]
mod testing;

pub use adapter::ConnectionAdapter;
pub use config::{EarlyEventPolicy, TransportConfig};
pub use connection::{BrokenDelegate, Connection, DataReceivedDelegate, NewConnectionDelegate};
pub use server::{HttpServerNetworkTransport, ServerTransport};

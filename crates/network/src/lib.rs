//! Raw network layer
//!
//! This crate provides the byte-stream primitives the HTTP transport is built
//! on. The two core traits, [`RawConnection`] and [`RawEndpoint`], describe an
//! event-driven connection and a listening service respectively. Both push
//! events to caller supplied callbacks from their own background threads.
//!
//! [`NetworkConnection`] and [`NetworkEndpoint`] implement the traits in terms
//! of [`std::net`] sockets.
//!
//! # Examples
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use network::{Mode, NetworkConnection, NetworkEndpoint, RawConnection, RawEndpoint};
//!
//! let mut endpoint = NetworkEndpoint::new();
//! endpoint.open(
//!     Box::new(|connection: NetworkConnection| {
//!         tracing::info!(peer = %connection.peer_address(), "accepted");
//!     }),
//!     Box::new(|_, _| {}),
//!     Mode::Connection,
//!     Ipv4Addr::UNSPECIFIED,
//!     0,
//! )?;
//!
//! let client = NetworkConnection::connect(Ipv4Addr::LOCALHOST, endpoint.bound_port())?;
//! # Ok::<(), eyre::Error>(())
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

mod config;
mod connection;
mod endpoint;

pub use config::NetworkConfig;
pub use connection::NetworkConnection;
pub use endpoint::NetworkEndpoint;

/// Callback invoked with every chunk of bytes read from a connection
pub type MessageReceivedDelegate = Box<dyn FnMut(Vec<u8>) + Send>;

/// Callback invoked once when a connection is broken
///
/// The flag is `true` when the peer closed the stream in an orderly fashion
/// and `false` when the connection failed.
pub type BrokenDelegate = Box<dyn FnOnce(bool) + Send>;

/// Callback invoked with every connection accepted by an endpoint
pub type NewConnectionDelegate<C> = Box<dyn FnMut(C) + Send>;

/// Callback invoked with every datagram received by an endpoint
pub type PacketReceivedDelegate = Box<dyn FnMut(SocketAddrV4, Vec<u8>) + Send>;

/// Kind of traffic an endpoint handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Stream oriented: incoming connections are accepted and reported
    Connection,
    /// Message oriented: incoming datagrams are reported
    Datagram,
}

/// An established byte-stream connection
///
/// Events are pushed to the callbacks given to [`RawConnection::process`]
/// from a thread owned by the implementation. All other methods may be
/// called from any thread.
pub trait RawConnection: Send + Sync + 'static {
    /// Start processing events for the connection
    ///
    /// `on_message` receives inbound data in the order it was read and
    /// `on_broken` is called at most once, after the last `on_message` call.
    ///
    /// # Errors
    ///
    /// Returns an error if processing is already running, if the connection
    /// has been closed, or if the processing threads cannot be started.
    fn process(
        &self,
        on_message: MessageReceivedDelegate,
        on_broken: BrokenDelegate,
    ) -> eyre::Result<()>;

    /// Queue bytes to be written to the peer
    fn send_message(&self, message: Vec<u8>);

    /// Close the connection
    ///
    /// With `graceful` set, messages already queued are written before the
    /// connection is shut down.
    fn close(&self, graceful: bool);

    /// IPv4 address of the remote peer
    fn peer_address(&self) -> Ipv4Addr;

    /// Port of the remote peer
    fn peer_port(&self) -> u16;
}

/// A listening service that produces [`RawConnection`]s
pub trait RawEndpoint: Send + 'static {
    /// The connection type handed to the new connection callback
    type Connection: RawConnection;

    /// Open the endpoint on `local_address:port`
    ///
    /// A `port` of 0 requests an ephemeral port, see
    /// [`RawEndpoint::bound_port`]. In [`Mode::Connection`] the
    /// `on_packet` callback is never called.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is already open or the socket cannot
    /// be bound. The endpoint stays closed in that case.
    fn open(
        &mut self,
        on_new_connection: NewConnectionDelegate<Self::Connection>,
        on_packet: PacketReceivedDelegate,
        mode: Mode,
        local_address: Ipv4Addr,
        port: u16,
    ) -> eyre::Result<()>;

    /// Stop accepting and release the socket
    fn close(&mut self);

    /// Port the endpoint is bound to, or 0 when it is not open
    fn bound_port(&self) -> u16;
}

/// Normalise a socket address to IPv4, unwrapping IPv4-mapped IPv6 addresses
pub(crate) fn ipv4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(addr) => Some(addr),
        SocketAddr::V6(addr) => addr
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, addr.port())),
    }
}

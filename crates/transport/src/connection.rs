use std::sync::Arc;

/// Callback receiving each chunk of data read from the peer
pub type DataReceivedDelegate = Box<dyn FnMut(Vec<u8>) + Send>;

/// Callback notified when the connection has been broken
pub type BrokenDelegate = Box<dyn FnOnce() + Send>;

/// Callback receiving every connection accepted by a [`crate::ServerTransport`]
pub type NewConnectionDelegate = Arc<dyn Fn(Arc<dyn Connection>) + Send + Sync>;

/// A connection to a remote peer, as seen by the HTTP engine
///
/// Delegates may be registered and replaced at any time, including from
/// inside a delegate invocation. They are invoked from the network layer's
/// threads and never while the connection holds an internal lock.
///
/// Once a connection has been broken, by the peer or through
/// [`Connection::break_connection`], no delegate is invoked again.
pub trait Connection: Send + Sync {
    /// Identity of the remote peer, formatted as `"<ipv4>:<port>"`
    fn peer_id(&self) -> &str;

    /// Set the callback invoked with each chunk of data received from the peer
    ///
    /// Chunks are delivered in the order they were read, but their boundaries
    /// need not match the writes made by the peer.
    fn set_data_received_delegate(&self, delegate: DataReceivedDelegate);

    /// Set the callback invoked once when the connection is broken by the peer
    fn set_broken_delegate(&self, delegate: BrokenDelegate);

    /// Hand the data over to the network layer for sending to the peer
    fn send_data(&self, data: Vec<u8>);

    /// Break the connection
    ///
    /// With `graceful` set, data already handed over by
    /// [`Connection::send_data`] is sent before the connection is closed.
    fn break_connection(&self, graceful: bool);
}

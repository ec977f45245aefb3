//! TCP-based connection implementation

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use eyre::{Context, Result};

use crate::{BrokenDelegate, MessageReceivedDelegate, NetworkConfig, RawConnection};

enum Outbound {
    Message(Vec<u8>),
    Close,
}

struct Shared {
    stream: TcpStream,
    peer: SocketAddrV4,
    local: SocketAddrV4,
    closing: AtomicBool,
}

impl Shared {
    fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            tracing::trace!(peer = %self.peer, error = %e, "shutting down socket");
        }
    }
}

/// TCP connection driven by a reader and a writer thread
///
/// Outbound messages are queued on a channel and written by the writer
/// thread, so [`RawConnection::send_message`] never blocks on the socket.
/// Messages queued before [`RawConnection::process`] is called are written
/// once processing starts.
///
/// Dropping the connection closes it, unless a close was already requested,
/// in which case a graceful close is allowed to finish in the background.
///
/// # Examples
///
/// ```no_run
/// use std::net::Ipv4Addr;
/// use network::{NetworkConnection, RawConnection};
///
/// let client = NetworkConnection::connect(Ipv4Addr::LOCALHOST, 8080)?;
/// client.process(
///     Box::new(|data: Vec<u8>| println!("received {} bytes", data.len())),
///     Box::new(|graceful| println!("broken (graceful: {graceful})")),
/// )?;
/// client.send_message(b"GET / HTTP/1.1\r\n\r\n".to_vec());
/// # Ok::<(), eyre::Error>(())
/// ```
pub struct NetworkConnection {
    shared: Arc<Shared>,
    outbound: Sender<Outbound>,
    // Option because the writer thread takes it when processing starts
    queued: Mutex<Option<Receiver<Outbound>>>,
    read_buffer_size: usize,
}

impl NetworkConnection {
    /// Wrap an established stream
    ///
    /// # Errors
    ///
    /// Returns an error if the socket addresses cannot be read, are not IPv4,
    /// or the stream cannot be switched to blocking mode.
    pub fn from_stream(stream: TcpStream, config: &NetworkConfig) -> Result<Self> {
        let peer = stream.peer_addr().context("reading peer address")?;
        let peer = crate::ipv4(peer).ok_or_else(|| eyre::eyre!("peer {peer} is not IPv4"))?;
        let local = stream.local_addr().context("reading local address")?;
        let local =
            crate::ipv4(local).ok_or_else(|| eyre::eyre!("local address {local} is not IPv4"))?;
        stream
            .set_nonblocking(false)
            .context("switching stream to blocking mode")?;

        let (outbound, queued) = crossbeam_channel::unbounded();
        Ok(Self {
            shared: Arc::new(Shared {
                stream,
                peer,
                local,
                closing: AtomicBool::new(false),
            }),
            outbound,
            queued: Mutex::new(Some(queued)),
            read_buffer_size: config.read_buffer_size,
        })
    }

    /// Connect to a listening peer
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is refused or otherwise fails
    #[tracing::instrument(level = "debug")]
    pub fn connect(address: Ipv4Addr, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((address, port))
            .wrap_err_with(|| format!("connecting to {address}:{port}"))?;
        tracing::debug!("connection made");
        Self::from_stream(stream, &NetworkConfig::default())
    }

    /// Address of the remote peer
    pub fn peer(&self) -> SocketAddrV4 {
        self.shared.peer
    }

    /// Port of the local end of the connection
    pub fn local_port(&self) -> u16 {
        self.shared.local.port()
    }

    fn is_processing(&self) -> bool {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl RawConnection for NetworkConnection {
    fn process(
        &self,
        on_message: MessageReceivedDelegate,
        on_broken: BrokenDelegate,
    ) -> Result<()> {
        let peer = self.shared.peer;
        if self.shared.closing.load(Ordering::SeqCst) {
            eyre::bail!("connection to {peer} is closed");
        }

        let queued = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| eyre::eyre!("connection to {peer} is already processing"))?;

        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(format!("network-writer-{peer}"))
            .spawn(move || write_loop(shared, queued))
            .wrap_err("spawning writer thread")?;

        let shared = Arc::clone(&self.shared);
        let read_buffer_size = self.read_buffer_size;
        let spawned = thread::Builder::new()
            .name(format!("network-reader-{peer}"))
            .spawn(move || read_loop(shared, read_buffer_size, on_message, on_broken));
        if let Err(e) = spawned {
            self.close(false);
            return Err(e).wrap_err("spawning reader thread");
        }

        tracing::debug!(%peer, "processing connection");
        Ok(())
    }

    fn send_message(&self, message: Vec<u8>) {
        if self.shared.closing.load(Ordering::SeqCst) {
            tracing::trace!(peer = %self.shared.peer, "dropping message for closed connection");
            return;
        }
        if self.outbound.send(Outbound::Message(message)).is_err() {
            tracing::trace!(peer = %self.shared.peer, "writer has stopped, dropping message");
        }
    }

    fn close(&self, graceful: bool) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(peer = %self.shared.peer, graceful, "closing connection");

        // without a writer thread nothing would flush the queue
        if !(graceful && self.is_processing()) {
            self.shared.shutdown();
        }
        let _ = self.outbound.send(Outbound::Close);
    }

    fn peer_address(&self) -> Ipv4Addr {
        *self.shared.peer.ip()
    }

    fn peer_port(&self) -> u16 {
        self.shared.peer.port()
    }
}

impl Drop for NetworkConnection {
    fn drop(&mut self) {
        self.close(false);
    }
}

fn read_loop(
    shared: Arc<Shared>,
    read_buffer_size: usize,
    mut on_message: MessageReceivedDelegate,
    on_broken: BrokenDelegate,
) {
    let mut buffer = vec![0; read_buffer_size];
    let graceful = loop {
        match (&shared.stream).read(&mut buffer) {
            Ok(0) => break true,
            Ok(n) => {
                tracing::trace!(peer = %shared.peer, bytes = n, "received data");
                on_message(buffer[..n].to_vec());
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(peer = %shared.peer, error = %e, "read failed");
                break false;
            }
        }
    };

    tracing::debug!(peer = %shared.peer, graceful, "connection broken");
    on_broken(graceful);
}

fn write_loop(shared: Arc<Shared>, queued: Receiver<Outbound>) {
    for message in queued.iter() {
        match message {
            Outbound::Message(bytes) => {
                if let Err(e) = (&shared.stream).write_all(&bytes) {
                    tracing::debug!(peer = %shared.peer, error = %e, "write failed");
                    shared.shutdown();
                    return;
                }
                tracing::trace!(peer = %shared.peer, bytes = bytes.len(), "sent data");
            }
            Outbound::Close => {
                shared.shutdown();
                return;
            }
        }
    }
}

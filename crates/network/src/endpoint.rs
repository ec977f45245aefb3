//! TCP listening endpoint

use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::thread::{self, JoinHandle};

use eyre::{Context, Result};

use crate::{
    Mode, NetworkConfig, NetworkConnection, NewConnectionDelegate, PacketReceivedDelegate,
    RawEndpoint,
};

struct Listening {
    port: u16,
    shutdown: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

/// Connection oriented endpoint backed by a [`TcpListener`]
///
/// Accepting happens on a background thread which polls a non-blocking
/// listener and checks for a shutdown signal between polls. Closing the
/// endpoint waits for that thread to finish, so once
/// [`RawEndpoint::close`] returns the port is released and the new
/// connection callback will not be called again.
///
/// Datagram mode is not supported.
pub struct NetworkEndpoint {
    config: NetworkConfig,
    listening: Option<Listening>,
}

impl NetworkEndpoint {
    pub fn new() -> Self {
        Self::with_config(NetworkConfig::default())
    }

    pub fn with_config(config: NetworkConfig) -> Self {
        Self {
            config,
            listening: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.listening.is_some()
    }
}

impl Default for NetworkEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl RawEndpoint for NetworkEndpoint {
    type Connection = NetworkConnection;

    fn open(
        &mut self,
        on_new_connection: NewConnectionDelegate<NetworkConnection>,
        _on_packet: PacketReceivedDelegate,
        mode: Mode,
        local_address: Ipv4Addr,
        port: u16,
    ) -> Result<()> {
        if mode == Mode::Datagram {
            eyre::bail!("datagram endpoints are not supported");
        }
        if let Some(listening) = &self.listening {
            eyre::bail!("endpoint is already open on port {}", listening.port);
        }
        self.config.validate().context("invalid network configuration")?;

        let listener = TcpListener::bind((local_address, port))
            .wrap_err_with(|| format!("binding listener on {local_address}:{port}"))?;
        listener
            .set_nonblocking(true)
            .context("switching listener to non-blocking mode")?;
        let bound_port = listener
            .local_addr()
            .context("reading bound address")?
            .port();

        let (shutdown, shutdown_rx) = oneshot::channel();
        let config = self.config.clone();
        let thread = thread::Builder::new()
            .name(format!("network-accept-{bound_port}"))
            .spawn(move || accept_loop(listener, config, shutdown_rx, on_new_connection))
            .wrap_err("spawning accept thread")?;

        tracing::info!(address = %local_address, port = bound_port, "listener bound");
        self.listening = Some(Listening {
            port: bound_port,
            shutdown,
            thread,
        });
        Ok(())
    }

    fn close(&mut self) {
        let Some(listening) = self.listening.take() else {
            return;
        };
        let _ = listening.shutdown.send(());

        if listening.thread.thread().id() == thread::current().id() {
            tracing::debug!(port = listening.port, "endpoint closed from its accept thread");
            return;
        }
        if listening.thread.join().is_err() {
            tracing::warn!(port = listening.port, "accept thread panicked");
        }
        tracing::info!(port = listening.port, "listener closed");
    }

    fn bound_port(&self) -> u16 {
        self.listening.as_ref().map_or(0, |listening| listening.port)
    }
}

impl Drop for NetworkEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(
    listener: TcpListener,
    config: NetworkConfig,
    shutdown: oneshot::Receiver<()>,
    mut on_new_connection: NewConnectionDelegate<NetworkConnection>,
) {
    let interval = config.accept_poll_interval();

    // poll loop
    loop {
        // check for shutdown
        match shutdown.try_recv() {
            Ok(_) => return,
            Err(oneshot::TryRecvError::Empty) => {}
            Err(e) => {
                tracing::debug!(error = %e, "shutdown sender closed");
                return;
            }
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                tracing::debug!(peer = %addr, "accepted connection");
                match NetworkConnection::from_stream(stream, &config) {
                    Ok(connection) => on_new_connection(connection),
                    Err(e) => {
                        tracing::warn!(peer = %addr, error = %e, "dropping accepted connection")
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(interval),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                thread::sleep(interval);
            }
        }
    }
}

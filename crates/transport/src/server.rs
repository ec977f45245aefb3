use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use eyre::WrapErr;
use network::{Mode, NetworkEndpoint, RawConnection, RawEndpoint};

use crate::{Connection, ConnectionAdapter, EarlyEventPolicy, NewConnectionDelegate, TransportConfig};

/// The listening side of a transport, as seen by the HTTP engine
pub trait ServerTransport: Send {
    /// Start accepting connections on `port`, or an ephemeral port if 0
    ///
    /// Every accepted connection is handed to the current new connection
    /// delegate, initially `new_connection_delegate`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is already bound or the port cannot
    /// be bound. The transport is left unbound in the latter case.
    fn bind_network(
        &mut self,
        port: u16,
        new_connection_delegate: NewConnectionDelegate,
    ) -> eyre::Result<()>;

    /// Port the transport is bound to, or 0 when it is not bound
    fn bound_port(&self) -> u16;

    /// Stop accepting connections
    ///
    /// Connections already handed out are not affected.
    fn release_network(&mut self);

    /// Replace the delegate receiving subsequently accepted connections
    fn set_new_connection_delegate(&mut self, delegate: NewConnectionDelegate);
}

type DelegateSlot = Arc<Mutex<Option<NewConnectionDelegate>>>;

/// [`ServerTransport`] built on a [`RawEndpoint`]
///
/// Each accepted raw connection is wrapped in a [`ConnectionAdapter`] whose
/// processing is started straight away. Connections that fail to start are
/// closed and never reported.
pub struct HttpServerNetworkTransport<E: RawEndpoint = NetworkEndpoint> {
    endpoint: E,
    config: TransportConfig,
    new_connection_delegate: DelegateSlot,

    // present while bound, cleared before the endpoint is closed
    accepting: Option<Arc<AtomicBool>>,
}

impl HttpServerNetworkTransport {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        let endpoint = NetworkEndpoint::with_config(config.network.clone());
        Self::with_endpoint(endpoint, config)
    }
}

impl Default for HttpServerNetworkTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: RawEndpoint> HttpServerNetworkTransport<E> {
    pub fn with_endpoint(endpoint: E, config: TransportConfig) -> Self {
        Self {
            endpoint,
            config,
            new_connection_delegate: Arc::default(),
            accepting: None,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_bound(&self) -> bool {
        self.accepting.is_some()
    }
}

impl<E: RawEndpoint> ServerTransport for HttpServerNetworkTransport<E> {
    #[tracing::instrument(skip(self, new_connection_delegate))]
    fn bind_network(
        &mut self,
        port: u16,
        new_connection_delegate: NewConnectionDelegate,
    ) -> eyre::Result<()> {
        if self.is_bound() {
            eyre::bail!("transport is already bound to port {}", self.bound_port());
        }

        // stored first, connections may be accepted before `open` returns
        let previous = self
            .new_connection_delegate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(new_connection_delegate);

        let accepting = Arc::new(AtomicBool::new(true));
        let opened = self.endpoint.open(
            accept_connections(
                Arc::clone(&self.new_connection_delegate),
                Arc::clone(&accepting),
                self.config.early_events,
            ),
            // only called for datagram endpoints
            Box::new(|_, _| {}),
            Mode::Connection,
            self.config.bind_address,
            port,
        );

        if let Err(e) = opened {
            *self
                .new_connection_delegate
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = previous;
            return Err(e).wrap_err("binding network");
        }

        self.accepting = Some(accepting);
        tracing::info!(port = self.bound_port(), "network bound");
        Ok(())
    }

    fn bound_port(&self) -> u16 {
        self.endpoint.bound_port()
    }

    fn release_network(&mut self) {
        let Some(accepting) = self.accepting.take() else {
            return;
        };
        let port = self.bound_port();
        accepting.store(false, Ordering::SeqCst);
        self.endpoint.close();
        tracing::info!(port, "network released");
    }

    fn set_new_connection_delegate(&mut self, delegate: NewConnectionDelegate) {
        let previous = self
            .new_connection_delegate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(delegate);
        drop(previous);
    }
}

impl<E: RawEndpoint> Drop for HttpServerNetworkTransport<E> {
    fn drop(&mut self) {
        self.release_network();
    }
}

/// Build the endpoint callback that turns raw connections into started
/// adapters and reports them
fn accept_connections<C: RawConnection>(
    slot: DelegateSlot,
    accepting: Arc<AtomicBool>,
    policy: EarlyEventPolicy,
) -> network::NewConnectionDelegate<C> {
    Box::new(move |raw: C| {
        if !accepting.load(Ordering::SeqCst) {
            tracing::debug!("network released, closing connection");
            raw.close(false);
            return;
        }

        let adapter = ConnectionAdapter::new(raw, policy);
        if let Err(e) = adapter.start() {
            tracing::warn!(peer = adapter.peer_id(), error = %e, "dropping connection");
            adapter.break_connection(false);
            return;
        }

        let delegate = slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match delegate {
            Some(delegate) => {
                tracing::debug!(peer = adapter.peer_id(), "new connection");
                let connection: Arc<dyn Connection> = Arc::new(adapter);
                delegate(connection);
            }
            None => {
                tracing::debug!(peer = adapter.peer_id(), "no new connection delegate, closing connection");
                adapter.break_connection(false);
            }
        }
    })
}

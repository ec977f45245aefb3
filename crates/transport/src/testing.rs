//! In-memory stand-ins for the raw network layer
//!
//! Both fakes are cheap handles to shared state: the test keeps one clone to
//! drive events and inspect calls, the code under test owns the other.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use network::{
    BrokenDelegate, MessageReceivedDelegate, Mode, NewConnectionDelegate, PacketReceivedDelegate,
    RawConnection, RawEndpoint,
};

#[derive(Default)]
struct ConnectionState {
    on_message: Option<MessageReceivedDelegate>,
    on_broken: Option<BrokenDelegate>,
    refuse_processing: bool,
    processing: bool,
    sent: Vec<Vec<u8>>,
    closed: Option<bool>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeConnection {
    state: Arc<Mutex<ConnectionState>>,
}

impl FakeConnection {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A connection whose processing cannot be started
    pub(crate) fn refusing() -> Self {
        let connection = Self::default();
        connection.state.lock().unwrap().refuse_processing = true;
        connection
    }

    /// Simulate the peer sending `data`
    pub(crate) fn receive(&self, data: &[u8]) {
        let delegate = self.state.lock().unwrap().on_message.take();
        if let Some(mut delegate) = delegate {
            delegate(data.to_vec());
            self.state.lock().unwrap().on_message = Some(delegate);
        }
    }

    /// Simulate the peer going away
    pub(crate) fn disconnect(&self) {
        let delegate = self.state.lock().unwrap().on_broken.take();
        if let Some(delegate) = delegate {
            delegate(true);
        }
    }

    pub(crate) fn is_processing(&self) -> bool {
        self.state.lock().unwrap().processing
    }

    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    /// The `graceful` flag of the first close, if any
    pub(crate) fn closed(&self) -> Option<bool> {
        self.state.lock().unwrap().closed
    }
}

impl RawConnection for FakeConnection {
    fn process(
        &self,
        on_message: MessageReceivedDelegate,
        on_broken: BrokenDelegate,
    ) -> eyre::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_processing {
            eyre::bail!("processing refused");
        }
        state.on_message = Some(on_message);
        state.on_broken = Some(on_broken);
        state.processing = true;
        Ok(())
    }

    fn send_message(&self, message: Vec<u8>) {
        self.state.lock().unwrap().sent.push(message);
    }

    fn close(&self, graceful: bool) {
        self.state.lock().unwrap().closed.get_or_insert(graceful);
    }

    fn peer_address(&self) -> Ipv4Addr {
        Ipv4Addr::new(192, 0, 2, 10)
    }

    fn peer_port(&self) -> u16 {
        40000
    }
}

#[derive(Default)]
struct EndpointState {
    on_new_connection: Option<NewConnectionDelegate<FakeConnection>>,
    opened_with: Option<(Mode, Ipv4Addr, u16)>,
    refuse_open: bool,
    port: u16,
}

#[derive(Clone, Default)]
pub(crate) struct FakeEndpoint {
    state: Arc<Mutex<EndpointState>>,
}

impl FakeEndpoint {
    pub(crate) const EPHEMERAL_PORT: u16 = 49152;

    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn refuse_open(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_open = refuse;
    }

    /// Simulate an incoming connection, returning false when the endpoint is
    /// not open
    pub(crate) fn accept(&self, connection: FakeConnection) -> bool {
        let delegate = self.state.lock().unwrap().on_new_connection.take();
        let Some(mut delegate) = delegate else {
            return false;
        };
        delegate(connection);

        let mut state = self.state.lock().unwrap();
        if state.opened_with.is_some() && state.on_new_connection.is_none() {
            state.on_new_connection = Some(delegate);
        }
        true
    }

    /// Take the accept callback, as a racing accept thread would hold it
    pub(crate) fn take_callback(&self) -> Option<NewConnectionDelegate<FakeConnection>> {
        self.state.lock().unwrap().on_new_connection.take()
    }

    pub(crate) fn opened_with(&self) -> Option<(Mode, Ipv4Addr, u16)> {
        self.state.lock().unwrap().opened_with
    }
}

impl RawEndpoint for FakeEndpoint {
    type Connection = FakeConnection;

    fn open(
        &mut self,
        on_new_connection: NewConnectionDelegate<FakeConnection>,
        _on_packet: PacketReceivedDelegate,
        mode: Mode,
        local_address: Ipv4Addr,
        port: u16,
    ) -> eyre::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_open {
            eyre::bail!("address in use");
        }
        if state.opened_with.is_some() {
            eyre::bail!("already open");
        }
        state.on_new_connection = Some(on_new_connection);
        state.opened_with = Some((mode, local_address, port));
        state.port = if port == 0 { Self::EPHEMERAL_PORT } else { port };
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.on_new_connection = None;
        state.opened_with = None;
        state.port = 0;
    }

    fn bound_port(&self) -> u16 {
        self.state.lock().unwrap().port
    }
}

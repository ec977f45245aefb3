//! Adapter from [`RawConnection`] to [`Connection`]
//!
//! The raw connection pushes events from its own threads as soon as
//! processing starts, which is before the HTTP engine has had a chance to
//! register any delegates. Events are therefore routed through a [`Relay`]
//! that looks the delegates up when each event fires and applies the
//! configured [`EarlyEventPolicy`] when a delegate is missing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use eyre::WrapErr;
use network::RawConnection;

use crate::{BrokenDelegate, Connection, DataReceivedDelegate, EarlyEventPolicy};

#[derive(Default)]
struct RelayState {
    data_received: Option<DataReceivedDelegate>,
    broken: Option<BrokenDelegate>,

    // chunks not yet handed to the data delegate
    pending: VecDeque<Vec<u8>>,
    broken_pending: bool,

    // set while a thread is running delegates with the lock released
    delivering: bool,
    closed: bool,
}

impl RelayState {
    /// Mark the connection closed, returning the delegates so the caller can
    /// drop them once the lock is released
    fn close(&mut self) -> (Option<DataReceivedDelegate>, Option<BrokenDelegate>) {
        self.closed = true;
        self.broken_pending = false;
        self.pending.clear();
        (self.data_received.take(), self.broken.take())
    }
}

struct Relay {
    peer_id: String,
    policy: EarlyEventPolicy,
    state: Mutex<RelayState>,
}

impl Relay {
    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn data_received(&self, data: Vec<u8>) {
        let mut state = self.lock();
        if state.closed {
            tracing::trace!(peer = %self.peer_id, bytes = data.len(), "connection closed, dropping data");
            return;
        }
        state.pending.push_back(data);
        if !state.delivering {
            self.deliver(state);
        }
    }

    fn broken(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.broken_pending = true;
        if !state.delivering {
            self.deliver(state);
        }
    }

    fn set_data_received(&self, delegate: DataReceivedDelegate) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        if state.broken_pending && state.pending.is_empty() {
            // the peer is gone and nothing is left to deliver
            drop(state);
            drop(delegate);
            return;
        }
        let previous = state.data_received.replace(delegate);
        if state.delivering || state.pending.is_empty() {
            drop(state);
        } else {
            self.deliver(state);
        }
        drop(previous);
    }

    fn set_broken(&self, delegate: BrokenDelegate) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let previous = state.broken.replace(delegate);
        if state.broken_pending && !state.delivering {
            self.deliver(state);
        } else {
            drop(state);
        }
        drop(previous);
    }

    fn close(&self) {
        let released = self.lock().close();
        drop(released);
    }

    /// Hand pending events to the delegates, in order
    ///
    /// Only one thread delivers at a time; events raised meanwhile are queued
    /// and picked up by the delivering thread. Delegates run without the lock
    /// held, and delegates replaced or released during delivery are dropped
    /// only after it is released, as they may own the connection.
    fn deliver<'a>(&'a self, mut state: MutexGuard<'a, RelayState>) {
        let mut retired = Vec::new();
        let mut broken = None;
        state.delivering = true;

        while !state.closed {
            let Some(mut delegate) = state.data_received.take() else {
                break;
            };
            let Some(data) = state.pending.pop_front() else {
                state.data_received = Some(delegate);
                break;
            };

            drop(state);
            let unwinding = ResetOnUnwind(self);
            delegate(data);
            drop(unwinding);
            state = self.lock();

            // keep the delegate unless it was replaced while running
            if state.closed || state.data_received.is_some() {
                retired.push(delegate);
            } else {
                state.data_received = Some(delegate);
            }
        }

        if !state.closed && !state.pending.is_empty() && self.policy == EarlyEventPolicy::Drop {
            tracing::trace!(
                peer = %self.peer_id,
                chunks = state.pending.len(),
                "no data delegate, dropping data"
            );
            state.pending.clear();
        }

        // the broken notification never overtakes data still waiting for delivery
        if !state.closed && state.broken_pending && state.pending.is_empty() {
            if let Some(delegate) = state.broken.take() {
                broken = Some(delegate);
                retired.extend(state.close().0);
            } else if self.policy == EarlyEventPolicy::Drop {
                tracing::trace!(peer = %self.peer_id, "no broken delegate, dropping notification");
                retired.extend(state.close().0);
            } else {
                // no more data can arrive, only the notification is kept
                retired.extend(state.data_received.take());
            }
        }

        state.delivering = false;
        drop(state);

        if let Some(delegate) = broken {
            tracing::debug!(peer = %self.peer_id, "reporting broken connection");
            delegate();
        }
    }
}

/// Clears the delivering flag if a delegate panics, so later events are
/// still delivered
struct ResetOnUnwind<'a>(&'a Relay);

impl Drop for ResetOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().delivering = false;
        }
    }
}

/// [`Connection`] implementation wrapping a single [`RawConnection`]
///
/// The adapter owns the raw connection: dropping the adapter drops it.
/// Processing does not begin until [`ConnectionAdapter::start`] is called.
pub struct ConnectionAdapter<C: RawConnection> {
    raw: C,
    relay: Arc<Relay>,
}

impl<C: RawConnection> ConnectionAdapter<C> {
    pub fn new(raw: C, policy: EarlyEventPolicy) -> Self {
        let peer_id = format!("{}:{}", raw.peer_address(), raw.peer_port());
        Self {
            raw,
            relay: Arc::new(Relay {
                peer_id,
                policy,
                state: Mutex::new(RelayState::default()),
            }),
        }
    }

    /// Start processing events from the raw connection
    ///
    /// The callbacks handed to the raw connection resolve the delegates each
    /// time an event fires, so delegates registered later still receive
    /// subsequent events.
    ///
    /// # Errors
    ///
    /// Returns an error if the raw connection cannot start processing. The
    /// adapter must then be discarded.
    pub fn start(&self) -> eyre::Result<()> {
        let on_data = Arc::clone(&self.relay);
        let on_broken = Arc::clone(&self.relay);
        self.raw
            .process(
                Box::new(move |data| on_data.data_received(data)),
                Box::new(move |_graceful| on_broken.broken()),
            )
            .wrap_err_with(|| format!("starting connection from {}", self.relay.peer_id))
    }

    pub fn policy(&self) -> EarlyEventPolicy {
        self.relay.policy
    }
}

impl<C: RawConnection> Connection for ConnectionAdapter<C> {
    fn peer_id(&self) -> &str {
        &self.relay.peer_id
    }

    fn set_data_received_delegate(&self, delegate: DataReceivedDelegate) {
        self.relay.set_data_received(delegate);
    }

    fn set_broken_delegate(&self, delegate: BrokenDelegate) {
        self.relay.set_broken(delegate);
    }

    fn send_data(&self, data: Vec<u8>) {
        tracing::trace!(peer = %self.relay.peer_id, bytes = data.len(), "sending data");
        self.raw.send_message(data);
    }

    fn break_connection(&self, graceful: bool) {
        tracing::debug!(peer = %self.relay.peer_id, graceful, "breaking connection");
        self.relay.close();
        self.raw.close(graceful);
    }
}

impl<C: RawConnection> Drop for ConnectionAdapter<C> {
    fn drop(&mut self) {
        self.relay.close();
    }
}

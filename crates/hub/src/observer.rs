//! One admitted client connection.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    tokio::sync::Mutex,
    tracing::{debug, warn},
};

use trellis_protocol::{Address, CONTROL_WRITE_TIMEOUT_MS, Event, Message};

use crate::{
    registry::Registry,
    transport::{FrameSink, TransportError},
};

/// In-memory handle for one admitted client. The address is frozen at
/// admission; registry identity is the address value.
pub struct Observer {
    address: Address,
    sink: Arc<dyn FrameSink>,
    /// Serializes every outbound frame on this connection: notifies, pings,
    /// provisioning, close frames.
    write_lock: Mutex<()>,
    /// Single-shot CLOSED latch.
    closed: AtomicBool,
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("address", &self.address)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Observer {
    pub fn new(address: Address, sink: Arc<dyn FrameSink>) -> Arc<Self> {
        Arc::new(Self {
            address,
            sink,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Registry identity.
    pub fn key(&self) -> &Address {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Latch the CLOSED state. Returns true for the first caller only.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Write one frame under the write lock.
    pub async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let _guard = self.write_lock.lock().await;
        self.sink.write_message(message).await
    }

    /// Write a native ping under the write lock.
    pub async fn ping(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let _guard = self.write_lock.lock().await;
        self.sink.write_ping(payload).await
    }

    /// Deliver a routed event if this observer's address matches the
    /// receiver pattern. A write failure is logged only; the connection's own
    /// loops will observe the broken transport and drive the CLOSED
    /// transition.
    pub async fn on_notify(&self, event: &Event, sender: &Address, receiver: &Address) {
        if self.is_closed() || !self.address.matches(receiver) {
            return;
        }
        let message = Message::new(
            sender.clone(),
            receiver.clone(),
            event.action,
            event.data.clone(),
        );
        if let Err(e) = self.send(&message).await {
            warn!(addr = %self.address, error = %e, "failed to deliver event");
        }
    }

    /// Best-effort close frame.
    pub async fn on_close(&self, _event: &Event) {
        let _guard = self.write_lock.lock().await;
        if let Err(e) = self
            .sink
            .write_close(Duration::from_millis(CONTROL_WRITE_TIMEOUT_MS))
            .await
        {
            debug!(addr = %self.address, error = %e, "close frame not delivered");
        }
    }

    /// The single-shot transition out of REGISTERED: deregister, best-effort
    /// close frame, done. Any later trigger is a no-op.
    pub async fn shutdown(self: &Arc<Self>, registry: &Registry) {
        if !self.begin_close() {
            return;
        }
        registry.deregister(self).await;
        let _guard = self.write_lock.lock().await;
        let _ = self
            .sink
            .write_close(Duration::from_millis(CONTROL_WRITE_TIMEOUT_MS))
            .await;
    }
}

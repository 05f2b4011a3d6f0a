//! Shared mocks for the hub's unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {anyhow::Result, async_trait::async_trait};

use {
    trellis_bridge::{InboundHandler, NotifyBridge},
    trellis_config::HubConfig,
    trellis_protocol::{Address, Message},
    trellis_store::SqliteHubStore,
};

use crate::{
    state::{HubControl, HubState},
    transport::{FrameSink, FrameSource, TransportError},
};

pub(crate) fn addr(s: &str) -> Address {
    Address::parse(s).unwrap()
}

// ── Recording sink ───────────────────────────────────────────────────────────

/// Records every frame and panics if two writes ever overlap.
pub(crate) struct RecordingSink {
    pub frames: std::sync::Mutex<Vec<Message>>,
    in_write: AtomicBool,
    pub pings: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_writes: AtomicBool,
}

impl RecordingSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: std::sync::Mutex::new(Vec::new()),
            in_write: AtomicBool::new(false),
            pings: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub(crate) fn frames(&self) -> Vec<Message> {
        self.frames.lock().unwrap().clone()
    }

    async fn enter(&self) {
        assert!(
            !self.in_write.swap(true, Ordering::AcqRel),
            "interleaved writes on one transport"
        );
        tokio::task::yield_now().await;
    }

    fn leave(&self) {
        self.in_write.store(false, Ordering::Release);
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn write_message(&self, message: &Message) -> Result<(), TransportError> {
        self.enter().await;
        let out = if self.fail_writes.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            self.frames.lock().unwrap().push(message.clone());
            Ok(())
        };
        self.leave();
        out
    }

    async fn write_ping(&self, _payload: Vec<u8>) -> Result<(), TransportError> {
        self.enter().await;
        self.pings.fetch_add(1, Ordering::AcqRel);
        self.leave();
        Ok(())
    }

    async fn write_close(&self, _deadline: Duration) -> Result<(), TransportError> {
        self.enter().await;
        self.closes.fetch_add(1, Ordering::AcqRel);
        self.leave();
        Ok(())
    }
}

// ── Scripted source ──────────────────────────────────────────────────────────

/// Feeds a fixed sequence of frames, then reports the remote as closed.
pub(crate) struct ScriptedSource {
    frames: VecDeque<Result<Message, TransportError>>,
}

impl ScriptedSource {
    pub(crate) fn new(frames: Vec<Message>) -> Self {
        Self {
            frames: frames.into_iter().map(Ok).collect(),
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            frames: VecDeque::new(),
        }
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_message(&mut self) -> Option<Result<Message, TransportError>> {
        self.frames.pop_front()
    }
}

// ── Recording bridge ─────────────────────────────────────────────────────────

pub(crate) struct RecordingBridge {
    pub sent: std::sync::Mutex<Vec<String>>,
}

impl RecordingBridge {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotifyBridge for RecordingBridge {
    async fn send(&self, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn start_inbound(&self, _handler: InboundHandler) -> Result<()> {
        Ok(())
    }
}

// ── State builder ────────────────────────────────────────────────────────────

pub(crate) struct TestHub {
    pub state: Arc<HubState>,
    pub bridge: Arc<RecordingBridge>,
    pub store: Arc<SqliteHubStore>,
    pub control: tokio::sync::mpsc::Receiver<HubControl>,
}

/// A hub state over an in-memory store, a recording bridge, and the `demo`
/// tenancy.
pub(crate) async fn test_hub(setup_mode: bool) -> TestHub {
    let mut config = HubConfig::default();
    config.api_key = "hub-master-key".into();
    config.setup_mode = setup_mode;
    config.address = addr("demo.server.hub.main.1");

    let store = Arc::new(SqliteHubStore::connect("sqlite::memory:").await.unwrap());
    let bridge = RecordingBridge::new();
    let (control_tx, control) = tokio::sync::mpsc::channel(4);

    let auth: Arc<dyn trellis_store::AuthStore> = store.clone();
    let endpoints: Arc<dyn trellis_store::EndpointStore> = store.clone();
    let log: Arc<dyn trellis_store::LogStore> = store.clone();
    let dyn_bridge: Arc<dyn NotifyBridge> = bridge.clone();
    let state = HubState::new(config, auth, endpoints, log, dyn_bridge, control_tx);

    TestHub {
        state,
        bridge,
        store,
        control,
    }
}

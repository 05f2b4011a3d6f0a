//! Listener lifecycle: axum router, per-connection tasks, graceful shutdown
//! and the setup-protocol restart loop.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use {
    axum::{
        Json, Router,
        extract::{State, WebSocketUpgrade, ws::WebSocket},
        response::IntoResponse,
        routing::get,
    },
    futures::{StreamExt, future::BoxFuture},
    tokio::{net::TcpListener, sync::mpsc},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    trellis_bridge::{InboundHandler, NoopBridge, NotifyBridge},
    trellis_config::HubConfig,
    trellis_protocol::{Event, PING_INTERVAL_MS},
    trellis_store::{EndpointConfig, EndpointStore, SqliteHubStore},
    trellis_telegram::TelegramBridge,
};

use crate::{
    command, dispatch, handshake,
    observer::Observer,
    state::{HubControl, HubState},
    transport::{FrameSink, WsSink, WsSource},
};

/// Startup knobs carried from the command line over the loaded config.
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    pub config_path: Option<PathBuf>,
    pub bind: Option<String>,
    pub port: Option<u16>,
}

/// Run the hub until it is told to shut down. Each loop iteration is one
/// lifecycle cycle: load config, open the store, build the bridge, serve;
/// a setup restart reloads everything with a fresh, empty registry.
pub async fn run(options: RunOptions) -> anyhow::Result<()> {
    let mut staged: Vec<EndpointConfig> = Vec::new();
    let mut announce_restart = false;

    loop {
        let mut config = trellis_config::load(options.config_path.as_deref())?;
        if let Some(bind) = &options.bind {
            config.listen.bind.clone_from(bind);
        }
        if let Some(port) = options.port {
            config.listen.port = port;
        }
        config.validate()?;
        if config.tls.enabled {
            // Termination happens in front of the hub; the cert paths are
            // carried in config for the deployment, not consumed here.
            warn!("tls.enabled is set; the hub listens in plaintext behind the terminator");
        }

        let store = Arc::new(SqliteHubStore::connect(&config.store.url).await?);
        let bridge = build_bridge(&config);
        let (control_tx, mut control_rx) = mpsc::channel::<HubControl>(4);
        let auth: Arc<dyn trellis_store::AuthStore> = store.clone();
        let endpoints: Arc<dyn EndpointStore> = store.clone();
        let log: Arc<dyn trellis_store::LogStore> = store;
        let state = HubState::new(config, auth, endpoints, log, bridge, control_tx);

        // Endpoints staged by the previous cycle's setup protocol land in
        // the freshly (re)connected store.
        for endpoint in staged.drain(..) {
            if let Err(e) = state.endpoints.upsert(endpoint).await {
                warn!(error = %e, "failed to upsert staged endpoint");
            }
        }

        let handler: InboundHandler = {
            let state = Arc::clone(&state);
            Arc::new(move |text: String| -> BoxFuture<'static, ()> {
                let state = Arc::clone(&state);
                Box::pin(async move { command::handle_inbound(&state, text).await })
            })
        };
        if let Err(e) = state.bridge.start_inbound(handler).await {
            warn!(error = %e, "bridge inbound channel failed to start");
        }

        let addr: SocketAddr = format!(
            "{}:{}",
            state.config.listen.bind, state.config.listen.port
        )
        .parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %listener.local_addr()?,
            domain = state.domain(),
            setup_mode = state.config.setup_mode,
            "hub listening"
        );

        if announce_restart {
            announce_restart = false;
            if let Err(e) = state
                .bridge
                .send("server is provisioned and is restarting")
                .await
            {
                warn!(error = %e, "restart notification failed");
            }
        }

        let shutdown = CancellationToken::new();
        let control_task = tokio::spawn({
            let state = Arc::clone(&state);
            let shutdown = shutdown.clone();
            async move {
                let reason = tokio::select! {
                    control = control_rx.recv() => control.unwrap_or(HubControl::Shutdown),
                    _ = tokio::signal::ctrl_c() => HubControl::Shutdown,
                };
                if matches!(reason, HubControl::Shutdown) {
                    state
                        .registry
                        .close(&Event::text("server shutting down"))
                        .await;
                }
                shutdown.cancel();
                reason
            }
        });

        axum::serve(listener, router(Arc::clone(&state)))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        match control_task.await {
            Ok(HubControl::Restart { staged_endpoints }) => {
                staged = staged_endpoints;
                announce_restart = true;
                info!("restarting listener after setup");
            },
            _ => {
                info!("hub stopped");
                return Ok(());
            },
        }
    }
}

/// The hub's HTTP surface: the WebSocket upgrade and a health probe.
pub fn router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade_handler))
        .route("/healthz", get(health_handler))
        .with_state(state)
}

fn build_bridge(config: &HubConfig) -> Arc<dyn NotifyBridge> {
    if config.telegram.enabled {
        Arc::new(TelegramBridge::new(config.telegram.clone()))
    } else {
        Arc::new(NoopBridge)
    }
}

async fn health_handler(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "domain": state.domain(),
        "setup_mode": state.config.setup_mode,
        "connections": state.registry.len().await,
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// One admitted connection end to end: handshake → registration →
/// provisioning → ping task + read loop → CLOSED.
pub async fn handle_connection(socket: WebSocket, state: Arc<HubState>) {
    let (writer, reader) = socket.split();
    let sink: Arc<dyn FrameSink> = Arc::new(WsSink::new(writer));
    let mut source = WsSource::new(reader);

    let observer = match handshake::admit(Arc::clone(&sink), &mut source, &state).await {
        Ok(observer) => observer,
        Err(e) => {
            info!(error = %e, "registration failed");
            return;
        },
    };

    state.registry.register(Arc::clone(&observer)).await;
    let clients = state.registry.len().await;
    info!(
        addr = %observer.address(),
        clients,
        "client admitted"
    );

    dispatch::provision(&state, &observer).await;

    let ping = tokio::spawn(ping_loop(Arc::clone(&state), Arc::clone(&observer)));
    dispatch::run_read_loop(&state, &observer, &mut source).await;
    ping.abort();

    info!(addr = %observer.address(), "connection closed");
}

/// Transport-level liveness: a native ping carrying the server's canonical
/// address, every ping interval, until the observer closes or a write fails.
async fn ping_loop(state: Arc<HubState>, observer: Arc<Observer>) {
    let payload = state.server_address().to_string().into_bytes();
    let mut ticker = tokio::time::interval(Duration::from_millis(PING_INTERVAL_MS));
    // The first tick is immediate; the handshake already proved the
    // transport, so skip it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if observer.is_closed() {
            return;
        }
        if let Err(e) = observer.ping(payload.clone()).await {
            debug!(addr = %observer.address(), error = %e, "ping failed");
            observer.shutdown(&state.registry).await;
            return;
        }
    }
}

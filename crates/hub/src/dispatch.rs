//! The action dispatcher: the per-connection read loop and the table that
//! turns inbound messages into routed notifications or administrative
//! effects.

use std::{ops::ControlFlow, sync::Arc};

use tracing::{debug, info, warn};

use trellis_protocol::{Action, Address, EntityKind, Event, Message};

use crate::{
    observer::Observer,
    setup,
    state::{HubState, store_call},
    transport::FrameSource,
};

/// Receiver domain routed to the notify bridge instead of the registry.
const BRIDGE_DOMAIN: &str = "telegram";

/// Consume frames until the transport breaks, the remote closes, or an
/// action terminates the connection, then drive the CLOSED transition.
pub async fn run_read_loop(
    state: &Arc<HubState>,
    observer: &Arc<Observer>,
    source: &mut dyn FrameSource,
) {
    while let Some(next) = source.next_message().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(e) => {
                debug!(addr = %observer.address(), error = %e, "read failed");
                break;
            },
        };
        if dispatch(state, observer.address(), msg).await.is_break() {
            break;
        }
    }
    observer.shutdown(&state.registry).await;
}

/// Dispatch one inbound message on behalf of `self_addr` (an observer's
/// address, or the bridge identity for inbound bridge commands).
pub async fn dispatch(
    state: &Arc<HubState>,
    self_addr: &Address,
    msg: Message,
) -> ControlFlow<()> {
    if state.config.setup_mode {
        dispatch_setup_mode(state, self_addr, msg).await
    } else {
        dispatch_action(state, self_addr, msg).await
    }
}

/// Setup-mode lockdown: only `setup` is processed; everything else bounces
/// back to the sender.
async fn dispatch_setup_mode(
    state: &Arc<HubState>,
    self_addr: &Address,
    msg: Message,
) -> ControlFlow<()> {
    if msg.action == Action::Setup {
        return setup::handle(state, self_addr, msg).await;
    }
    let text = format!("{} action rejected in setup mode", msg.action);
    state
        .registry
        .notify(&Event::text(text), state.server_address(), &msg.sender)
        .await;
    ControlFlow::Continue(())
}

async fn dispatch_action(
    state: &Arc<HubState>,
    self_addr: &Address,
    msg: Message,
) -> ControlFlow<()> {
    match msg.action {
        // A second registration on an admitted connection is a protocol
        // violation; the connection closes.
        Action::Register => {
            warn!(addr = %self_addr, "register on an admitted connection");
            ControlFlow::Break(())
        },

        Action::Log => {
            if let Some(text) = msg.data_str() {
                info!(from = %msg.sender, text, "client log");
                match store_call(state.log.write(text, &msg.sender)).await {
                    Ok(Ok(())) => {},
                    outcome => warn!(from = %msg.sender, ?outcome, "log write failed"),
                }
            }
            ControlFlow::Continue(())
        },

        Action::Readlog => {
            let filter = msg.data_str().unwrap_or_default();
            match store_call(state.log.read(filter)).await {
                Ok(Ok(rows)) => {
                    let data = serde_json::to_value(rows).unwrap_or_default();
                    state
                        .registry
                        .notify(&Event::new(Action::Log, data), self_addr, &msg.sender)
                        .await;
                },
                outcome => warn!(filter, ?outcome, "log read failed"),
            }
            ControlFlow::Continue(())
        },

        Action::Value => {
            state
                .registry
                .notify(
                    &Event::new(Action::Value, msg.data.clone()),
                    self_addr,
                    &msg.receiver,
                )
                .await;
            ControlFlow::Continue(())
        },

        Action::Discover => {
            match store_call(state.endpoints.list_by_domain(state.domain())).await {
                Ok(Ok(endpoints)) => {
                    let data = serde_json::to_value(endpoints).unwrap_or_default();
                    state
                        .registry
                        .notify(&Event::new(Action::Inform, data), self_addr, &msg.sender)
                        .await;
                },
                outcome => warn!(?outcome, "endpoint discovery failed"),
            }
            ControlFlow::Continue(())
        },

        Action::Setup => setup::handle(state, self_addr, msg).await,

        Action::Activate => {
            if let Some(code) = msg.data_str() {
                match store_call(state.auth.activate(code)).await {
                    Ok(Ok(true)) => info!(code, "address activated"),
                    Ok(Ok(false)) => warn!(code, "activation code matched nothing"),
                    outcome => warn!(code, ?outcome, "activation failed"),
                }
            }
            ControlFlow::Continue(())
        },

        Action::Import => {
            if let Some(json) = msg.data_str() {
                match store_call(state.auth.import_all(json)).await {
                    Ok(errors) if errors.is_empty() => info!("auth snapshot imported"),
                    Ok(errors) => {
                        for error in errors {
                            warn!(error, "import row rejected");
                        }
                    },
                    Err(_) => warn!("auth import timed out"),
                }
            }
            ControlFlow::Continue(())
        },

        Action::Export => {
            match store_call(state.auth.export_all()).await {
                Ok(Ok(snapshot)) => {
                    let data = serde_json::to_value(snapshot).unwrap_or_default();
                    state
                        .registry
                        .notify(&Event::new(Action::Export, data), self_addr, &msg.sender)
                        .await;
                },
                outcome => warn!(?outcome, "auth export failed"),
            }
            ControlFlow::Continue(())
        },

        // notify, cmd, and every reflected server tag route by receiver
        // pattern; the telegram pseudo-domain goes out through the bridge.
        _ => {
            if msg.receiver.domain == BRIDGE_DOMAIN {
                if let Some(text) = msg.data_str()
                    && let Err(e) = state.bridge.send(text).await
                {
                    warn!(error = %e, "bridge send failed");
                }
            } else {
                state
                    .registry
                    .notify(
                        &Event::new(msg.action, msg.data.clone()),
                        self_addr,
                        &msg.receiver,
                    )
                    .await;
            }
            ControlFlow::Continue(())
        },
    }
}

/// Ship the host's endpoint configuration to a freshly admitted IoT client.
/// Other client kinds are not provisioned.
pub async fn provision(state: &HubState, observer: &Observer) {
    if observer.address().kind != EntityKind::Iot {
        return;
    }
    match store_call(state.endpoints.find_by_host(observer.address())).await {
        Ok(Ok(endpoints)) => {
            let message = Message::new(
                state.server_address().clone(),
                observer.address().clone(),
                Action::Provision,
                serde_json::to_value(endpoints).unwrap_or_default(),
            );
            if let Err(e) = observer.send(&message).await {
                warn!(addr = %observer.address(), error = %e, "provisioning write failed");
            }
        },
        outcome => warn!(addr = %observer.address(), ?outcome, "provisioning lookup failed"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use {
        crate::testutil::{RecordingSink, ScriptedSource, TestHub, addr, test_hub},
        trellis_store::{AuthRecord, AuthStore, EndpointConfig, EndpointStore, LogStore},
    };

    async fn admit_pair(hub: &TestHub) -> (Arc<Observer>, Arc<RecordingSink>, Arc<RecordingSink>) {
        let cli_sink = RecordingSink::new();
        let iot_sink = RecordingSink::new();
        let cli = Observer::new(addr("demo.cli.box.*.*"), cli_sink.clone());
        let iot = Observer::new(addr("demo.iot.h1.*.*"), iot_sink.clone());
        hub.state.registry.register(Arc::clone(&cli)).await;
        hub.state.registry.register(iot).await;
        (cli, cli_sink, iot_sink)
    }

    fn value_to(receiver: &str, data: serde_json::Value) -> Message {
        Message::new(addr("demo.cli.box"), addr(receiver), Action::Value, data)
    }

    #[tokio::test]
    async fn value_routes_to_matching_observers_only() {
        let hub = test_hub(false).await;
        let (cli, cli_sink, iot_sink) = admit_pair(&hub).await;

        let flow = dispatch(
            &hub.state,
            &cli.address().clone(),
            value_to("demo.iot.h1", serde_json::json!(42)),
        )
        .await;
        assert!(flow.is_continue());

        let delivered = iot_sink.frames();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].action, Action::Value);
        assert_eq!(delivered[0].data, serde_json::json!(42));
        assert_eq!(delivered[0].sender, *cli.address());
        assert!(cli_sink.frames().is_empty());
    }

    #[tokio::test]
    async fn readlog_replies_with_matching_rows_as_a_log_frame() {
        let hub = test_hub(false).await;
        let (cli, cli_sink, iot_sink) = admit_pair(&hub).await;
        hub.store
            .write("sensor boom detected", &addr("demo.iot.h1.relay.4"))
            .await
            .unwrap();
        hub.store.write("all quiet", &addr("demo.iot.h1.relay.4")).await.unwrap();

        let msg = Message::new(
            cli.address().clone(),
            hub.state.server_address().clone(),
            Action::Readlog,
            serde_json::Value::String("boom".into()),
        );
        dispatch(&hub.state, &cli.address().clone(), msg).await;

        let frames = cli_sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].action, Action::Log);
        let rows = frames[0].data.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["message"], "sensor boom detected");
        assert!(iot_sink.frames().is_empty());
    }

    #[tokio::test]
    async fn discover_replies_with_the_domain_endpoints() {
        let hub = test_hub(false).await;
        let (cli, cli_sink, _) = admit_pair(&hub).await;
        EndpointStore::upsert(&*hub.store, EndpointConfig {
            address: "demo.endpoint.h1.relay.1".into(),
            name: "relay".into(),
            attributes: serde_json::Value::Null,
        })
        .await
        .unwrap();

        let msg = Message::new(
            cli.address().clone(),
            hub.state.server_address().clone(),
            Action::Discover,
            serde_json::Value::Null,
        );
        dispatch(&hub.state, &cli.address().clone(), msg).await;

        let frames = cli_sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].action, Action::Inform);
        assert_eq!(frames[0].data.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn activate_enables_the_pending_record() {
        let hub = test_hub(false).await;
        AuthStore::upsert(&*hub.store, AuthRecord {
            name: "demo.iot.h9.*.*".into(),
            api_key: "0123456789abc".into(),
            enabled: false,
            activation_code: "X4K2P9".into(),
        })
        .await
        .unwrap();

        let msg = Message::new(
            addr("demo.cli.box"),
            hub.state.server_address().clone(),
            Action::Activate,
            serde_json::Value::String("X4K2P9".into()),
        );
        dispatch(&hub.state, &addr("demo.cli.box.*.*"), msg).await;

        let record = hub.store.find(&addr("demo.iot.h9.*.*")).await.unwrap().unwrap();
        assert!(record.enabled);
    }

    #[tokio::test]
    async fn export_replies_with_the_snapshot() {
        let hub = test_hub(false).await;
        let (cli, cli_sink, _) = admit_pair(&hub).await;
        AuthStore::upsert(&*hub.store, AuthRecord {
            name: "demo.iot.h1.*.*".into(),
            api_key: "0123456789abc".into(),
            enabled: true,
            activation_code: String::new(),
        })
        .await
        .unwrap();

        let msg = Message::new(
            cli.address().clone(),
            hub.state.server_address().clone(),
            Action::Export,
            serde_json::Value::Null,
        );
        dispatch(&hub.state, &cli.address().clone(), msg).await;

        let frames = cli_sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].action, Action::Export);
        assert_eq!(frames[0].data["auth"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn telegram_receiver_domain_routes_to_the_bridge() {
        let hub = test_hub(false).await;
        let (cli, _, iot_sink) = admit_pair(&hub).await;

        let msg = Message::new(
            cli.address().clone(),
            addr("telegram.*.*.*.*"),
            Action::Notify,
            serde_json::Value::String("pump pressure low".into()),
        );
        dispatch(&hub.state, &cli.address().clone(), msg).await;

        assert_eq!(hub.bridge.sent(), vec!["pump pressure low".to_string()]);
        assert!(iot_sink.frames().is_empty());
    }

    #[tokio::test]
    async fn register_on_an_admitted_connection_closes_it() {
        let hub = test_hub(false).await;
        let (cli, _, _) = admit_pair(&hub).await;

        let msg = Message::new(
            cli.address().clone(),
            hub.state.server_address().clone(),
            Action::Register,
            serde_json::Value::String("0123456789abc".into()),
        );
        let flow = dispatch(&hub.state, &cli.address().clone(), msg).await;
        assert!(flow.is_break());
    }

    #[tokio::test]
    async fn setup_mode_rejects_everything_but_setup() {
        let hub = test_hub(true).await;
        let (cli, cli_sink, iot_sink) = admit_pair(&hub).await;

        dispatch(
            &hub.state,
            &cli.address().clone(),
            value_to("demo.iot.h1", serde_json::json!(1)),
        )
        .await;

        // No routing happened; the sender got the lockdown notice.
        assert!(iot_sink.frames().is_empty());
        let frames = cli_sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].action, Action::Notify);
        assert_eq!(frames[0].data, "value action rejected in setup mode");
    }

    #[tokio::test]
    async fn iot_observers_are_provisioned_with_host_endpoints() {
        let hub = test_hub(false).await;
        EndpointStore::upsert(&*hub.store, EndpointConfig {
            address: "demo.endpoint.h1.relay.1".into(),
            name: "relay".into(),
            attributes: serde_json::json!({"pin": 4}),
        })
        .await
        .unwrap();

        let iot_sink = RecordingSink::new();
        let iot = Observer::new(addr("demo.iot.h1.*.*"), iot_sink.clone());
        provision(&hub.state, &iot).await;

        let frames = iot_sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].action, Action::Provision);
        assert_eq!(frames[0].data.as_array().unwrap().len(), 1);

        // Non-IoT clients are not provisioned.
        let cli_sink = RecordingSink::new();
        let cli = Observer::new(addr("demo.cli.box.*.*"), cli_sink.clone());
        provision(&hub.state, &cli).await;
        assert!(cli_sink.frames().is_empty());
    }

    #[tokio::test]
    async fn empty_endpoint_store_still_provisions_an_empty_list() {
        let hub = test_hub(false).await;
        let iot_sink = RecordingSink::new();
        let iot = Observer::new(addr("demo.iot.h1.*.*"), iot_sink.clone());
        provision(&hub.state, &iot).await;

        let frames = iot_sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, serde_json::json!([]));
    }

    #[tokio::test]
    async fn read_loop_shuts_the_observer_down_on_exhaustion() {
        let hub = test_hub(false).await;
        let sink = RecordingSink::new();
        let observer = Observer::new(addr("demo.cli.box.*.*"), sink.clone());
        hub.state.registry.register(Arc::clone(&observer)).await;

        let mut source = ScriptedSource::new(vec![value_to("demo.cli.box", serde_json::json!(1))]);
        run_read_loop(&hub.state, &observer, &mut source).await;

        assert!(observer.is_closed());
        assert!(hub.state.registry.is_empty().await);
        assert_eq!(sink.closes.load(std::sync::atomic::Ordering::Acquire), 1);
    }
}

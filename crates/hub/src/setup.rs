//! The setup protocol: provision configuration files, stage endpoint
//! records, drain the registry, and hand the restart to the lifecycle loop.

use std::{ops::ControlFlow, path::Path, sync::Arc};

use {
    base64::Engine,
    tracing::{info, warn},
};

use {
    trellis_protocol::{Address, ENDPOINTS_SENTINEL, Event, Message, SetupPayload},
    trellis_store::EndpointConfig,
};

use crate::state::{HubControl, HubState};

/// Handle one `setup` message. On success the registry is drained and a
/// restart request is queued; the caller's read loop exits. On any failure
/// the sender is notified and nothing restarts.
pub async fn handle(state: &Arc<HubState>, _self_addr: &Address, msg: Message) -> ControlFlow<()> {
    let sender = msg.sender.clone();
    let payload: SetupPayload = match serde_json::from_value(msg.data) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "malformed setup payload");
            notify_sender(state, &sender, "invalid setup payload").await;
            return ControlFlow::Continue(());
        },
    };

    if payload.api_key != state.config.api_key {
        warn!(from = %sender, "setup attempt with a bad api key");
        notify_sender(state, &sender, "sorry, you are not authorized to set up this server").await;
        return ControlFlow::Continue(());
    }

    let mut staged: Vec<EndpointConfig> = Vec::new();
    for file in &payload.setup_files {
        let content = match base64::engine::general_purpose::STANDARD.decode(&file.content) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %file.path, error = %e, "setup file is not valid base64");
                notify_sender(state, &sender, "malformed setup file content").await;
                return ControlFlow::Continue(());
            },
        };

        if file.path == ENDPOINTS_SENTINEL {
            match serde_json::from_slice::<Vec<EndpointConfig>>(&content) {
                Ok(endpoints) => staged.extend(endpoints),
                Err(e) => {
                    warn!(error = %e, "staged endpoints did not parse");
                    notify_sender(state, &sender, "malformed staged endpoints").await;
                    return ControlFlow::Continue(());
                },
            }
        } else if let Err(e) = write_setup_file(&file.path, &content) {
            // A single bad file does not abort provisioning of the rest.
            warn!(path = %file.path, error = %e, "failed to write setup file");
        }
    }

    info!(
        files = payload.setup_files.len(),
        staged = staged.len(),
        "server provisioned, restarting"
    );

    state
        .registry
        .notify(
            &Event::text("server is provisioned and is restarting"),
            state.server_address(),
            &Address::default(),
        )
        .await;
    state.registry.close(&Event::text("Setup done")).await;
    state
        .request_control(HubControl::Restart {
            staged_endpoints: staged,
        })
        .await;

    ControlFlow::Break(())
}

async fn notify_sender(state: &Arc<HubState>, sender: &Address, text: &str) {
    state
        .registry
        .notify(&Event::text(text), state.server_address(), sender)
        .await;
}

/// Write one provisioned file, creating a single missing parent directory.
fn write_setup_file(path: &str, content: &[u8]) -> std::io::Result<()> {
    let path = Path::new(path);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir(parent)?;
    }
    std::fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o744))?;
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use {
        crate::{
            observer::Observer,
            testutil::{RecordingSink, addr, test_hub},
        },
        base64::Engine as _,
        trellis_protocol::{Action, SetupFile},
    };

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    fn setup_msg(api_key: &str, files: Vec<SetupFile>) -> Message {
        Message::new(
            addr("demo.browser.b1"),
            addr("demo.server.hub.main.1"),
            Action::Setup,
            serde_json::to_value(SetupPayload {
                api_key: api_key.into(),
                setup_files: files,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn bad_api_key_notifies_and_does_not_restart() {
        let mut hub = test_hub(true).await;
        let sink = RecordingSink::new();
        let observer = Observer::new(addr("demo.browser.b1.*.*"), sink.clone());
        hub.state.registry.register(observer).await;

        let flow = handle(
            &hub.state,
            &addr("demo.browser.b1.*.*"),
            setup_msg("wrong-key", vec![]),
        )
        .await;

        assert!(flow.is_continue());
        assert_eq!(hub.state.registry.len().await, 1);
        assert!(hub.control.try_recv().is_err());

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].data.as_str().unwrap().contains("not authorized"));
    }

    #[tokio::test]
    async fn malformed_staged_endpoints_do_not_restart() {
        let mut hub = test_hub(true).await;
        let files = vec![SetupFile {
            path: ENDPOINTS_SENTINEL.into(),
            content: b64(b"{not json"),
        }];

        let flow = handle(
            &hub.state,
            &addr("demo.browser.b1.*.*"),
            setup_msg("hub-master-key", files),
        )
        .await;

        assert!(flow.is_continue());
        assert!(hub.control.try_recv().is_err());
    }

    #[tokio::test]
    async fn provisioning_writes_files_drains_and_requests_restart() {
        let mut hub = test_hub(true).await;
        let sink = RecordingSink::new();
        let observer = Observer::new(addr("demo.browser.b1.*.*"), sink.clone());
        hub.state.registry.register(observer).await;

        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("conf/default.json");
        let endpoints = vec![EndpointConfig {
            address: "demo.endpoint.h1.relay.1".into(),
            name: "relay".into(),
            attributes: serde_json::json!({"pin": 4}),
        }];
        let files = vec![
            SetupFile {
                path: file_path.to_string_lossy().into_owned(),
                content: b64(br#"{"listen":{"port":9000}}"#),
            },
            SetupFile {
                path: ENDPOINTS_SENTINEL.into(),
                content: b64(&serde_json::to_vec(&endpoints).unwrap()),
            },
        ];

        let flow = handle(
            &hub.state,
            &addr("demo.browser.b1.*.*"),
            setup_msg("hub-master-key", files),
        )
        .await;
        assert!(flow.is_break());

        // The file landed, with its single-level parent created.
        let written = std::fs::read_to_string(&file_path).unwrap();
        assert!(written.contains("9000"));

        // The registry drained after the restart broadcast.
        assert!(hub.state.registry.is_empty().await);
        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].data.as_str().unwrap().contains("restarting"));
        assert_eq!(sink.closes.load(std::sync::atomic::Ordering::Acquire), 1);

        // The staged endpoints rode along on the restart request.
        match hub.control.try_recv().unwrap() {
            HubControl::Restart { staged_endpoints } => {
                assert_eq!(staged_endpoints, endpoints);
            },
            other => panic!("expected restart, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn setup_works_in_normal_mode_too() {
        let mut hub = test_hub(false).await;
        let flow = handle(
            &hub.state,
            &addr("demo.cli.box.*.*"),
            setup_msg("hub-master-key", vec![]),
        )
        .await;
        assert!(flow.is_break());
        assert!(matches!(
            hub.control.try_recv().unwrap(),
            HubControl::Restart { .. }
        ));
    }
}

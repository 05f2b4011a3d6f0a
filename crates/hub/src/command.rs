//! Inbound bridge commands.
//!
//! Humans drive the hub from the notification channel with one-line commands
//! of the form `ACTION@ADDR:BODY`, e.g. `activate@demo.server.hub:X4K2P9` or
//! `value@demo.iot.h1:42`. Parsed commands run through the normal dispatch
//! table under the bridge's identity.

use std::sync::Arc;

use tracing::{debug, warn};

use trellis_protocol::{Action, Address, Message};

use crate::{dispatch, state::HubState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCommand {
    pub action: Action,
    pub receiver: Address,
    pub body: String,
}

/// Parse `ACTION@ADDR:BODY`. Whitespace around the parts is tolerated; the
/// body may be empty.
pub fn parse(text: &str) -> Option<BridgeCommand> {
    let (head, body) = text.split_once(':')?;
    let (action, receiver) = head.split_once('@')?;
    Some(BridgeCommand {
        action: Action::parse(action.trim())?,
        receiver: Address::parse(receiver.trim()).ok()?,
        body: body.trim().to_string(),
    })
}

/// Handle one inbound bridge message.
pub async fn handle_inbound(state: &Arc<HubState>, text: String) {
    let Some(command) = parse(&text) else {
        warn!(text, "unparseable bridge command");
        if let Err(e) = state
            .bridge
            .send("unrecognized command, expected ACTION@ADDR:BODY")
            .await
        {
            debug!(error = %e, "bridge reply failed");
        }
        return;
    };

    debug!(action = %command.action, receiver = %command.receiver, "bridge command");
    let sender = state.bridge_address();
    let message = Message::new(
        sender.clone(),
        command.receiver,
        command.action,
        serde_json::Value::String(command.body),
    );
    let _ = dispatch::dispatch(state, &sender, message).await;
}

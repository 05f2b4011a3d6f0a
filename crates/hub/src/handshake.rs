//! The registration handshake: one frame in, admit or reject.

use std::{sync::Arc, time::Duration};

use {
    rand::distr::{Alphanumeric, SampleString},
    thiserror::Error,
    tracing::{info, warn},
};

use {
    trellis_protocol::{
        ACTIVATION_CODE_LEN, Action, Address, CLOSE_HANDSHAKE_TIMEOUT_MS, EntityKind, Event,
        MIN_API_KEY_LEN, Message, REGISTER_TIMEOUT_MS,
    },
    trellis_store::{AuthRecord, StoreError},
};

use crate::{
    observer::Observer,
    state::{HubState, store_call},
    transport::{FrameSink, FrameSource, TransportError},
};

#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("invalid action, must be register")]
    WrongAction,

    #[error("missing or wrong domain `{0}` in registration")]
    WrongDomain(String),

    #[error("unauthorized address connection")]
    Unauthorized,

    #[error("address `{name}` pending activation with code {code}")]
    PendingActivation { name: String, code: String },

    #[error("ambiguous auth records for `{0}`")]
    AmbiguousAuth(String),

    #[error("no registration received within the deadline")]
    Timeout,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Read exactly one frame and either admit the client or reject and close
/// the transport. The returned observer is not yet registered; the caller
/// inserts it and starts the connection's tasks.
pub async fn admit(
    sink: Arc<dyn FrameSink>,
    source: &mut dyn FrameSource,
    state: &HubState,
) -> Result<Arc<Observer>, AdmitError> {
    let deadline = Duration::from_millis(REGISTER_TIMEOUT_MS);
    let msg = match tokio::time::timeout(deadline, source.next_message()).await {
        Ok(Some(Ok(msg))) => msg,
        Ok(Some(Err(e))) => {
            let _ = sink
                .write_close(Duration::from_millis(CLOSE_HANDSHAKE_TIMEOUT_MS))
                .await;
            return Err(e.into());
        },
        Ok(None) => return Err(TransportError::Closed.into()),
        Err(_) => {
            let _ = sink
                .write_close(Duration::from_millis(CLOSE_HANDSHAKE_TIMEOUT_MS))
                .await;
            return Err(AdmitError::Timeout);
        },
    };

    if msg.action != Action::Register {
        reject(&sink, state, &msg.sender, "invalid action, must be register").await;
        return Err(AdmitError::WrongAction);
    }

    let mut address = msg.sender.clone();
    address.normalize();

    if address.domain != state.domain() {
        reject(&sink, state, &address, "missing or wrong domain in registration").await;
        return Err(AdmitError::WrongDomain(address.domain));
    }

    if !state.config.setup_mode {
        authorize(&sink, state, &address, &msg).await?;
    }

    let observer = Observer::new(address, sink);
    let welcome = if state.config.setup_mode {
        "setup mode".to_string()
    } else {
        format!("welcome {}", observer.address())
    };
    let accepted = Message::status(
        state.server_address().clone(),
        observer.address().clone(),
        Action::Accepted,
        welcome,
    );
    observer.send(&accepted).await?;

    Ok(observer)
}

/// Admission policy: a matching, enabled record with the right api key.
/// First contact with a plausible key creates a disabled record and a human
/// activation request.
async fn authorize(
    sink: &Arc<dyn FrameSink>,
    state: &HubState,
    address: &Address,
    msg: &Message,
) -> Result<(), AdmitError> {
    let Some(api_key) = msg.data_str() else {
        reject(sink, state, address, "unauthorized address connection").await;
        return Err(AdmitError::Unauthorized);
    };

    match store_call(state.auth.find(address)).await {
        Ok(Ok(Some(record))) => {
            if record.api_key == api_key && record.enabled {
                Ok(())
            } else {
                reject(sink, state, address, "unauthorized address connection").await;
                Err(AdmitError::Unauthorized)
            }
        },
        Ok(Ok(None)) if api_key.len() >= MIN_API_KEY_LEN => {
            first_contact(sink, state, address, api_key).await
        },
        Ok(Ok(None)) => {
            reject(sink, state, address, "unauthorized address connection").await;
            Err(AdmitError::Unauthorized)
        },
        Ok(Err(StoreError::AmbiguousPattern { pattern, .. })) => {
            reject(sink, state, address, "ambiguous authorization configuration").await;
            Err(AdmitError::AmbiguousAuth(pattern))
        },
        Ok(Err(e)) => {
            warn!(addr = %address, error = %e, "auth lookup failed");
            reject(sink, state, address, "authorization unavailable").await;
            Err(AdmitError::Unauthorized)
        },
        Err(_) => {
            warn!(addr = %address, "auth lookup timed out");
            reject(sink, state, address, "authorization unavailable").await;
            Err(AdmitError::Unauthorized)
        },
    }
}

/// Create a disabled record with a fresh activation code and tell a human.
async fn first_contact(
    sink: &Arc<dyn FrameSink>,
    state: &HubState,
    address: &Address,
    api_key: &str,
) -> Result<(), AdmitError> {
    // An IoT credential covers the whole host; browsers and tools register
    // their exact address.
    let mut name = address.clone();
    if name.kind == EntityKind::Iot {
        name.address = trellis_protocol::WILDCARD.to_string();
        name.id = trellis_protocol::WILDCARD.to_string();
    }

    let record = AuthRecord {
        name: name.to_string(),
        api_key: api_key.to_string(),
        enabled: false,
        activation_code: activation_code(),
    };
    let code = record.activation_code.clone();

    match store_call(state.auth.upsert(record)).await {
        Ok(Ok(())) => {},
        outcome => {
            warn!(addr = %address, ?outcome, "failed to persist pending auth record");
            reject(sink, state, address, "authorization unavailable").await;
            return Err(AdmitError::Unauthorized);
        },
    }

    let text = format!(
        "new address {name} tried to connect to the server, activation code {code}"
    );
    info!(addr = %name, "registration pending activation");
    if let Err(e) = state.bridge.send(&text).await {
        warn!(error = %e, "failed to notify bridge of pending activation");
    }
    state
        .registry
        .notify(
            &Event::text(text),
            state.server_address(),
            &Address::domain_wide(state.domain()),
        )
        .await;

    reject(sink, state, address, "account created, pending activation").await;
    Err(AdmitError::PendingActivation {
        name: name.to_string(),
        code,
    })
}

/// The rejection protocol: one best-effort `rejected` frame, then close.
async fn reject(sink: &Arc<dyn FrameSink>, state: &HubState, client: &Address, text: &str) {
    let message = Message::status(
        state.server_address().clone(),
        client.clone(),
        Action::Rejected,
        text,
    );
    let _ = sink.write_message(&message).await;
    let _ = sink
        .write_close(Duration::from_millis(CLOSE_HANDSHAKE_TIMEOUT_MS))
        .await;
}

fn activation_code() -> String {
    Alphanumeric
        .sample_string(&mut rand::rng(), ACTIVATION_CODE_LEN)
        .to_uppercase()
}

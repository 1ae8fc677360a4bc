// Built-in control actions

use super::{ConnectionId, ControlChannel, CONTROL_TAG};
use crate::dm::DirectMessageForwarder;
use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub const SET_CONFIG: &str = "SET_CONFIG";
pub const SYNC: &str = "SYNC";
pub const DM: &str = "DM";
pub const DM_GET_STATS: &str = "GET-STATS";
pub const DM_STATS: &str = "STATS";

/// Runs a named operator action on behalf of connection `origin`
pub trait ActionHandler: Send + Sync {
    fn handle(
        &self,
        channel: &ControlChannel,
        origin: ConnectionId,
        payload: Value,
    ) -> Result<()>;
}

impl<F> ActionHandler for F
where
    F: Fn(&ControlChannel, ConnectionId, Value) -> Result<()> + Send + Sync,
{
    fn handle(
        &self,
        channel: &ControlChannel,
        origin: ConnectionId,
        payload: Value,
    ) -> Result<()> {
        self(channel, origin, payload)
    }
}

/// Merge the payload object into the node config
pub struct SetConfigAction;

impl ActionHandler for SetConfigAction {
    fn handle(
        &self,
        channel: &ControlChannel,
        _origin: ConnectionId,
        payload: Value,
    ) -> Result<()> {
        match payload {
            Value::Object(patch) => Ok(channel.set_config(patch)?),
            Value::Null => Ok(()),
            other => bail!("{} expects an object, got {}", SET_CONFIG, other),
        }
    }
}

/// Push full config and status to operators
pub struct SyncAction;

impl ActionHandler for SyncAction {
    fn handle(
        &self,
        channel: &ControlChannel,
        _origin: ConnectionId,
        _payload: Value,
    ) -> Result<()> {
        channel.sync();
        Ok(())
    }
}

/// `DM` methods. `GET-STATS` answers the asking socket only with
/// `["CONTROL", "DM", "STATS", stats]` for the configured owner.
pub struct DirectMessageAction {
    forwarder: Arc<DirectMessageForwarder>,
}

impl DirectMessageAction {
    pub fn new(forwarder: Arc<DirectMessageForwarder>) -> Self {
        Self { forwarder }
    }
}

impl ActionHandler for DirectMessageAction {
    fn handle(
        &self,
        channel: &ControlChannel,
        origin: ConnectionId,
        payload: Value,
    ) -> Result<()> {
        let method = match &payload {
            Value::String(method) => method.as_str(),
            Value::Array(items) => items.first().and_then(Value::as_str).unwrap_or_default(),
            _ => "",
        };
        if method != DM_GET_STATS {
            debug!(method = %method, "Unhandled DM method");
            return Ok(());
        }

        let Some(owner) = channel.config().owner else {
            debug!("No owner configured; skipping DM stats");
            return Ok(());
        };
        let stats = serde_json::to_value(self.forwarder.stats(&owner))?;
        let frame = json!([CONTROL_TAG, DM, DM_STATS, stats]).to_string();
        if !channel.send_to(origin, frame) {
            debug!(connection = origin, "DM stats requester is gone");
        }
        Ok(())
    }
}

pub fn register_builtin_actions(channel: &ControlChannel) {
    channel.register_handler(SET_CONFIG, SetConfigAction);
    channel.register_handler(SYNC, SyncAction);
}

/// Expose `forwarder` under the `DM` action
pub fn register_dm_actions(channel: &ControlChannel, forwarder: Arc<DirectMessageForwarder>) {
    channel.register_handler(DM, DirectMessageAction::new(forwarder));
}

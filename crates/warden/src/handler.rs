use std::time::SystemTime;

use serde::Deserialize;
use serde_json::{json, Value};
use tether::{ChannelError, IncomingCall, IpcChannel};

use crate::api::ApiVersion;
use crate::output::{DebugLog, LogLevel, LogSource};
use crate::status::{StatusLevel, StatusReporter};
use crate::types::{InstanceId, ModuleType};

/// Which protocol generation a child speaks. Picked once per spawn from the
/// module type and the API version in its manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
	/// Connection modules built against the 1.x API.
	ConnectionLegacy,
	Connection,
	Surface,
}

impl HandlerKind {
	pub fn select(module_type: ModuleType, api: &ApiVersion) -> Option<Self> {
		match (module_type, api.major) {
			(ModuleType::Connection, 1) => Some(HandlerKind::ConnectionLegacy),
			(ModuleType::Connection, 2) => Some(HandlerKind::Connection),
			(ModuleType::Surface, 1) => Some(HandlerKind::Surface),
			_ => None,
		}
	}

	/// The API version this host implements for the kind.
	pub fn host_api(&self) -> ApiVersion {
		match self {
			HandlerKind::ConnectionLegacy => ApiVersion::new(1, 14, 0),
			HandlerKind::Connection => ApiVersion::new(2, 1, 0),
			HandlerKind::Surface => ApiVersion::new(1, 2, 0),
		}
	}

	pub fn module_type(&self) -> ModuleType {
		match self {
			HandlerKind::ConnectionLegacy | HandlerKind::Connection => ModuleType::Connection,
			HandlerKind::Surface => ModuleType::Surface,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			HandlerKind::ConnectionLegacy => "connection-legacy",
			HandlerKind::Connection => "connection",
			HandlerKind::Surface => "surface",
		}
	}
}

/// Per-instance configuration handed to the child at `init`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceSettings {
	pub config: Value,
	/// Only sent to connections on the current API.
	pub secrets: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
	#[error("{0} is not supported by {1} modules")]
	Unsupported(&'static str, &'static str),
	#[error(transparent)]
	Channel(#[from] ChannelError),
}

/// Host side of one running child. Owned by the instance that spawned it
/// until that process is replaced.
pub struct ChildHandler {
	kind: HandlerKind,
	instance: InstanceId,
	channel: IpcChannel,
}

#[derive(Deserialize)]
struct LogMessage {
	#[serde(default)]
	level: Option<String>,
	message: String,
}

#[derive(Deserialize)]
struct SetStatus {
	status: StatusLevel,
	#[serde(default)]
	message: Option<String>,
}

impl ChildHandler {
	pub fn new(kind: HandlerKind, instance: InstanceId, channel: IpcChannel) -> Self {
		Self {
			kind,
			instance,
			channel,
		}
	}

	pub fn kind(&self) -> HandlerKind {
		self.kind
	}

	pub fn instance(&self) -> &InstanceId {
		&self.instance
	}

	/// Sends the operating configuration. The child is usable once this
	/// returns `Ok`.
	pub async fn init(&self, label: &str, settings: &InstanceSettings) -> Result<(), HandlerError> {
		let payload = match self.kind {
			HandlerKind::ConnectionLegacy => json!({
				"label": label,
				"config": settings.config,
			}),
			HandlerKind::Connection => json!({
				"label": label,
				"config": settings.config,
				"secrets": settings.secrets.clone().unwrap_or(Value::Null),
			}),
			HandlerKind::Surface => json!({
				"instanceId": self.instance.as_str(),
				"label": label,
				"config": settings.config,
			}),
		};
		self.channel.call("init", payload).await?;
		Ok(())
	}

	/// Post-init hook. Only surfaces want to be told.
	pub async fn ready(&self) -> Result<(), HandlerError> {
		if self.kind == HandlerKind::Surface {
			self.channel.notify("ready", Value::Null)?;
		}
		Ok(())
	}

	/// Asks the child to release its resources before it is stopped.
	pub async fn destroy(&self) -> Result<(), HandlerError> {
		if self.channel.is_closed() {
			return Ok(());
		}
		self.channel.call("destroy", Value::Null).await?;
		Ok(())
	}

	/// Drops the channel. Outstanding calls fail with `Closed`.
	pub fn cleanup(&self) {
		self.channel.close();
	}

	pub async fn resubscribe_feedbacks(&self) -> Result<(), HandlerError> {
		self.connection_only("resubscribe_feedbacks")?;
		self.channel.call("resubscribe-feedbacks", Value::Null).await?;
		Ok(())
	}

	pub fn variables_changed(&self, names: &[String]) -> Result<(), HandlerError> {
		self.connection_only("variables_changed")?;
		self.channel
			.notify("variables-changed", json!({ "variables": names }))?;
		Ok(())
	}

	pub async fn entity_update(&self, entity: Value) -> Result<(), HandlerError> {
		self.connection_only("entity_update")?;
		self.channel.call("entity-update", entity).await?;
		Ok(())
	}

	pub async fn entity_delete(&self, entity_id: &str) -> Result<(), HandlerError> {
		self.connection_only("entity_delete")?;
		self.channel
			.call("entity-delete", json!({ "id": entity_id }))
			.await?;
		Ok(())
	}

	pub async fn entity_learn_options(&self, entity: Value) -> Result<Value, HandlerError> {
		self.connection_only("entity_learn_options")?;
		Ok(self.channel.call("entity-learn-options", entity).await?)
	}

	/// Answers a call the child made after registering.
	pub fn handle_call(&self, call: IncomingCall, debug_log: &dyn DebugLog, status: &dyn StatusReporter) {
		match call.name.as_str() {
			"log-message" => match serde_json::from_value::<LogMessage>(call.payload.clone()) {
				Ok(msg) => {
					let level = msg
						.level
						.as_deref()
						.map(LogLevel::parse)
						.unwrap_or(LogLevel::Info);
					debug_log.append_line(&self.instance, SystemTime::now(), LogSource::Module, level, &msg.message);
					reply_if_wanted(call, Ok(()));
				}
				Err(e) => reply_if_wanted(call, Err(format!("invalid log-message: {}", e))),
			},
			"set-status" => match serde_json::from_value::<SetStatus>(call.payload.clone()) {
				Ok(msg) => {
					status.set_status(&self.instance, msg.status, msg.message.as_deref());
					reply_if_wanted(call, Ok(()));
				}
				Err(e) => reply_if_wanted(call, Err(format!("invalid set-status: {}", e))),
			},
			other => {
				tracing::debug!(instance = %self.instance, "unhandled call {}", other);
				let message = format!("unknown call: {}", other);
				reply_if_wanted(call, Err(message));
			}
		}
	}

	fn connection_only(&self, op: &'static str) -> Result<(), HandlerError> {
		match self.kind {
			HandlerKind::Surface => Err(HandlerError::Unsupported(op, "surface")),
			_ => Ok(()),
		}
	}
}

fn reply_if_wanted(call: IncomingCall, result: Result<(), String>) {
	if !call.expects_reply() {
		return;
	}
	match result {
		Ok(()) => call.reply_ok(Value::Null),
		Err(e) => call.reply_err(e),
	}
}

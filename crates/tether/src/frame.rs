use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line on the wire.
///
/// Calls carry a `callback_id` when the sender expects a response; a call
/// without one is a notification. Responses echo the id of the call they
/// answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum Frame {
	Call {
		name: String,
		#[serde(default)]
		payload: Value,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		callback_id: Option<u64>,
	},
	Response {
		callback_id: u64,
		success: bool,
		#[serde(default)]
		payload: Value,
	},
}

impl Frame {
	pub fn call(name: impl Into<String>, payload: Value, callback_id: u64) -> Self {
		Frame::Call {
			name: name.into(),
			payload,
			callback_id: Some(callback_id),
		}
	}

	pub fn notify(name: impl Into<String>, payload: Value) -> Self {
		Frame::Call {
			name: name.into(),
			payload,
			callback_id: None,
		}
	}

	pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
		let mut data = serde_json::to_vec(self)?;
		data.push(b'\n');
		Ok(data)
	}

	/// Parses a single line. Returns `None` for anything that isn't a frame,
	/// which callers treat as plain console output from the child.
	pub fn decode(line: &str) -> Option<Self> {
		let trimmed = line.trim();
		if !trimmed.starts_with('{') {
			return None;
		}
		serde_json::from_str(trimmed).ok()
	}
}

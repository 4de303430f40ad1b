use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::frame::Frame;

/// Errors from channel operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
	/// The child closed its end, or the channel was closed locally.
	#[error("channel closed")]
	Closed,
	/// No response arrived within the call timeout.
	#[error("call '{0}' timed out")]
	Timeout(String),
	/// The child answered with `success: false`.
	#[error("remote error: {0}")]
	Remote(String),
}

/// Something the child sent that isn't a response to one of our calls.
#[derive(Debug)]
pub enum Inbound {
	Call(IncomingCall),
	/// A stdout line that didn't parse as a frame.
	Output(String),
}

/// A call made by the child. Dropping it without replying leaves the child
/// waiting, so handlers should always answer calls that expect a reply.
#[derive(Debug)]
pub struct IncomingCall {
	pub name: String,
	pub payload: Value,
	callback_id: Option<u64>,
	outbound: mpsc::UnboundedSender<Outgoing>,
}

impl IncomingCall {
	pub fn expects_reply(&self) -> bool {
		self.callback_id.is_some()
	}

	pub fn reply_ok(self, payload: Value) {
		self.reply(true, payload);
	}

	pub fn reply_err(self, message: impl Into<String>) {
		self.reply(false, Value::String(message.into()));
	}

	fn reply(self, success: bool, payload: Value) {
		if let Some(callback_id) = self.callback_id {
			let _ = self.outbound.send(Outgoing::Frame(Frame::Response {
				callback_id,
				success,
				payload,
			}));
		}
	}
}

#[derive(Debug)]
enum Outgoing {
	Frame(Frame),
	Close,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, ChannelError>>>>>;

/// Bidirectional frame channel over a child's stdio pipes.
///
/// Two background tasks own the pipes: a writer draining outgoing frames and
/// a reader routing responses to waiting callers and everything else to the
/// inbound receiver returned by [`IpcChannel::open`]. The inbound receiver
/// closes when the child's stdout reaches EOF.
#[derive(Clone)]
pub struct IpcChannel {
	outbound: mpsc::UnboundedSender<Outgoing>,
	pending: Pending,
	next_id: Arc<AtomicU64>,
	closed: Arc<AtomicBool>,
	call_timeout: Duration,
}

impl IpcChannel {
	pub fn open<R, W>(
		reader: R,
		writer: W,
		call_timeout: Duration,
	) -> (Self, mpsc::UnboundedReceiver<Inbound>)
	where
		R: AsyncRead + Send + Unpin + 'static,
		W: AsyncWrite + Send + Unpin + 'static,
	{
		let (out_tx, out_rx) = mpsc::unbounded_channel();
		let (in_tx, in_rx) = mpsc::unbounded_channel();
		let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

		let closed = Arc::new(AtomicBool::new(false));

		tokio::spawn(write_frames(writer, out_rx));
		tokio::spawn(read_frames(
			reader,
			in_tx,
			out_tx.clone(),
			Arc::clone(&pending),
			Arc::clone(&closed),
		));

		let channel = Self {
			outbound: out_tx,
			pending,
			next_id: Arc::new(AtomicU64::new(1)),
			closed,
			call_timeout,
		};
		(channel, in_rx)
	}

	/// Sends a call and waits for the matching response.
	pub async fn call(&self, name: &str, payload: Value) -> Result<Value, ChannelError> {
		if self.is_closed() {
			return Err(ChannelError::Closed);
		}
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = oneshot::channel();
		lock_pending(&self.pending).insert(id, tx);

		// The reader may have hit EOF and drained the waiters before we got in.
		let frame = Frame::call(name, payload, id);
		if self.is_closed() || self.outbound.send(Outgoing::Frame(frame)).is_err() {
			lock_pending(&self.pending).remove(&id);
			return Err(ChannelError::Closed);
		}

		match tokio::time::timeout(self.call_timeout, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(ChannelError::Closed),
			Err(_) => {
				lock_pending(&self.pending).remove(&id);
				Err(ChannelError::Timeout(name.to_string()))
			}
		}
	}

	/// Sends a call without waiting for (or asking for) a response.
	pub fn notify(&self, name: &str, payload: Value) -> Result<(), ChannelError> {
		if self.is_closed() {
			return Err(ChannelError::Closed);
		}
		self.outbound
			.send(Outgoing::Frame(Frame::notify(name, payload)))
			.map_err(|_| ChannelError::Closed)
	}

	/// Shuts down the writer half and fails every outstanding call.
	/// The channel also counts as closed once the child's stdout ends.
	pub fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
		let _ = self.outbound.send(Outgoing::Close);
		fail_pending(&self.pending);
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst) || self.outbound.is_closed()
	}
}

fn lock_pending(
	pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value, ChannelError>>>> {
	pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fail_pending(pending: &Pending) {
	let waiters: Vec<_> = lock_pending(pending).drain().collect();
	for (_, tx) in waiters {
		let _ = tx.send(Err(ChannelError::Closed));
	}
}

async fn write_frames<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outgoing>)
where
	W: AsyncWrite + Unpin,
{
	while let Some(outgoing) = rx.recv().await {
		let frame = match outgoing {
			Outgoing::Frame(frame) => frame,
			Outgoing::Close => {
				rx.close();
				break;
			}
		};
		let data = match frame.encode() {
			Ok(d) => d,
			Err(e) => {
				tracing::error!("failed to encode frame: {}", e);
				continue;
			}
		};
		if writer.write_all(&data).await.is_err() || writer.flush().await.is_err() {
			break;
		}
	}
	let _ = writer.shutdown().await;
}

async fn read_frames<R>(
	reader: R,
	inbound: mpsc::UnboundedSender<Inbound>,
	outbound: mpsc::UnboundedSender<Outgoing>,
	pending: Pending,
	closed: Arc<AtomicBool>,
) where
	R: AsyncRead + Unpin,
{
	let mut lines = BufReader::new(reader).lines();

	loop {
		let line = match lines.next_line().await {
			Ok(Some(line)) => line,
			Ok(None) => break,
			Err(e) => {
				tracing::debug!("ipc read error: {}", e);
				break;
			}
		};

		match Frame::decode(&line) {
			Some(Frame::Response {
				callback_id,
				success,
				payload,
			}) => {
				let waiter = lock_pending(&pending).remove(&callback_id);
				match waiter {
					Some(tx) => {
						let result = if success {
							Ok(payload)
						} else {
							Err(ChannelError::Remote(remote_message(&payload)))
						};
						let _ = tx.send(result);
					}
					None => tracing::warn!("response for unknown callback {}", callback_id),
				}
			}
			Some(Frame::Call {
				name,
				payload,
				callback_id,
			}) => {
				let _ = inbound.send(Inbound::Call(IncomingCall {
					name,
					payload,
					callback_id,
					outbound: outbound.clone(),
				}));
			}
			None => {
				if !line.trim().is_empty() {
					let _ = inbound.send(Inbound::Output(line));
				}
			}
		}
	}

	closed.store(true, Ordering::SeqCst);
	fail_pending(&pending);
}

fn remote_message(payload: &Value) -> String {
	match payload {
		Value::String(s) => s.clone(),
		Value::Object(map) => map
			.get("message")
			.and_then(Value::as_str)
			.map(str::to_string)
			.unwrap_or_else(|| payload.to_string()),
		Value::Null => "unknown error".to_string(),
		other => other.to_string(),
	}
}

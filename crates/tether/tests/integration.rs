use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

use tether::{ChannelError, Frame, Inbound, IpcChannel};

struct ChildEnd {
	lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
	writer: WriteHalf<DuplexStream>,
}

impl ChildEnd {
	async fn next_frame(&mut self) -> Frame {
		let line = self.lines.next_line().await.unwrap().expect("parent closed");
		Frame::decode(&line).expect("not a frame")
	}

	async fn write_line(&mut self, line: &str) {
		self.writer.write_all(line.as_bytes()).await.unwrap();
		self.writer.write_all(b"\n").await.unwrap();
	}

	async fn send(&mut self, frame: &Frame) {
		self.writer.write_all(&frame.encode().unwrap()).await.unwrap();
	}
}

fn pair(call_timeout: Duration) -> (IpcChannel, tokio::sync::mpsc::UnboundedReceiver<Inbound>, ChildEnd) {
	let (parent, child) = tokio::io::duplex(64 * 1024);
	let (parent_read, parent_write) = tokio::io::split(parent);
	let (child_read, child_write) = tokio::io::split(child);
	let (channel, inbound) = IpcChannel::open(parent_read, parent_write, call_timeout);
	let child = ChildEnd {
		lines: BufReader::new(child_read).lines(),
		writer: child_write,
	};
	(channel, inbound, child)
}

// --- Calls from the parent ---

#[tokio::test]
async fn call_resolves_with_child_response() {
	let (channel, _inbound, mut child) = pair(Duration::from_secs(5));

	let responder = tokio::spawn(async move {
		let frame = child.next_frame().await;
		let Frame::Call { name, payload, callback_id } = frame else {
			panic!("expected call");
		};
		assert_eq!(name, "init");
		assert_eq!(payload, json!({"label": "Rack A"}));
		child
			.send(&Frame::Response {
				callback_id: callback_id.unwrap(),
				success: true,
				payload: json!({"upgradeIndex": 3}),
			})
			.await;
		child
	});

	let result = channel.call("init", json!({"label": "Rack A"})).await;
	assert_eq!(result, Ok(json!({"upgradeIndex": 3})));
	responder.await.unwrap();
}

#[tokio::test]
async fn call_surfaces_remote_error_message() {
	let (channel, _inbound, mut child) = pair(Duration::from_secs(5));

	tokio::spawn(async move {
		let Frame::Call { callback_id, .. } = child.next_frame().await else {
			panic!("expected call");
		};
		child
			.send(&Frame::Response {
				callback_id: callback_id.unwrap(),
				success: false,
				payload: json!({"message": "bad config"}),
			})
			.await;
		child
	});

	let result = channel.call("init", Value::Null).await;
	assert_eq!(result, Err(ChannelError::Remote("bad config".into())));
}

#[tokio::test]
async fn call_times_out_without_response() {
	let (channel, _inbound, child) = pair(Duration::from_millis(50));

	let result = channel.call("destroy", Value::Null).await;
	assert_eq!(result, Err(ChannelError::Timeout("destroy".into())));
	drop(child);
}

#[tokio::test]
async fn pending_call_fails_when_child_goes_away() {
	let (channel, _inbound, mut child) = pair(Duration::from_secs(5));

	tokio::spawn(async move {
		let _ = child.next_frame().await;
		drop(child);
	});

	let result = channel.call("init", Value::Null).await;
	assert_eq!(result, Err(ChannelError::Closed));
}

#[tokio::test]
async fn notify_sends_call_without_callback() {
	let (channel, _inbound, mut child) = pair(Duration::from_secs(5));

	channel.notify("variablesChanged", json!(["a", "b"])).unwrap();
	let frame = child.next_frame().await;
	assert_eq!(frame, Frame::notify("variablesChanged", json!(["a", "b"])));
}

// --- Calls from the child ---

#[tokio::test]
async fn incoming_call_can_be_answered() {
	let (_channel, mut inbound, mut child) = pair(Duration::from_secs(5));

	child
		.send(&Frame::call("register", json!({"apiVersion": "2.0.0"}), 7))
		.await;

	let call = match inbound.recv().await {
		Some(Inbound::Call(call)) => call,
		other => panic!("expected call, got {:?}", other),
	};
	assert_eq!(call.name, "register");
	assert!(call.expects_reply());
	call.reply_ok(Value::Null);

	let frame = child.next_frame().await;
	assert_eq!(
		frame,
		Frame::Response {
			callback_id: 7,
			success: true,
			payload: Value::Null,
		}
	);
}

#[tokio::test]
async fn plain_lines_arrive_as_output() {
	let (_channel, mut inbound, mut child) = pair(Duration::from_secs(5));

	child.write_line("module booting").await;
	child.write_line("").await;
	child.write_line("still booting").await;
	drop(child);

	let mut lines = Vec::new();
	while let Some(msg) = inbound.recv().await {
		if let Inbound::Output(line) = msg {
			lines.push(line);
		}
	}
	assert_eq!(lines, vec!["module booting", "still booting"]);
}

#[tokio::test]
async fn close_stops_writer_and_fails_calls() {
	let (channel, _inbound, mut child) = pair(Duration::from_secs(5));

	channel.close();
	let eof = child.lines.next_line().await.unwrap();
	assert!(eof.is_none());

	let result = channel.call("init", Value::Null).await;
	assert!(matches!(result, Err(ChannelError::Closed)));
}

#[tokio::test]
async fn channel_reports_closed_after_child_eof() {
	let (channel, mut inbound, child) = pair(Duration::from_secs(5));
	drop(child);
	assert!(inbound.recv().await.is_none());
	assert!(channel.is_closed());
	assert_eq!(channel.call("destroy", Value::Null).await, Err(ChannelError::Closed));
}

//! # tether
//!
//! Process-pipe IPC between a supervisor and the plugin hosts it spawns.
//!
//! Each line on a child's stdin/stdout is one JSON [`Frame`]: either a call
//! (optionally carrying a callback id) or a response to an earlier call.
//! Lines that aren't frames are surfaced as console output.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tether::{Inbound, IpcChannel};
//!
//! # async fn demo(stdout: tokio::process::ChildStdout, stdin: tokio::process::ChildStdin) {
//! let (channel, mut inbound) = IpcChannel::open(stdout, stdin, Duration::from_secs(10));
//!
//! while let Some(msg) = inbound.recv().await {
//! 	match msg {
//! 		Inbound::Call(call) if call.name == tether::REGISTER_CALL => {
//! 			call.reply_ok(serde_json::Value::Null);
//! 			break;
//! 		}
//! 		Inbound::Call(call) => call.reply_err("not registered"),
//! 		Inbound::Output(line) => println!("child: {}", line),
//! 	}
//! }
//!
//! let _ = channel.call("init", serde_json::json!({})).await;
//! # }
//! ```

pub mod channel;
pub mod frame;
pub mod register;

pub use channel::{ChannelError, Inbound, IncomingCall, IpcChannel};
pub use frame::Frame;
pub use register::*;

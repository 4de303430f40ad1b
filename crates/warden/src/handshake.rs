//! Registration handshake of a single spawn attempt, as a pure state machine.
//!
//! ```text
//! Spawning -> AwaitingRegister -> Validating -> Initializing -> Ready -> Stopped
//!     \              \                \              \
//!      +--------------+----------------+--------------+--> Failed
//! ```
//!
//! The supervisor feeds events in and performs the side effects (replying to
//! the child, calling `init`, force-restarting) based on the resulting state.

use std::fmt;

use serde_json::Value;
use tether::RegisterMessage;

use crate::api::ApiVersion;
use crate::monitor::ChildExit;
use crate::types::{AuthToken, InstanceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
	IncompatibleApi,
	TokenMismatch,
	DuplicateRegister,
	InstanceMismatch,
	MissingConfig,
	InvalidPayload,
}

impl fmt::Display for RejectReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			RejectReason::IncompatibleApi => "incompatible api version",
			RejectReason::TokenMismatch => "verification token mismatch",
			RejectReason::DuplicateRegister => "already registered",
			RejectReason::InstanceMismatch => "instance id mismatch",
			RejectReason::MissingConfig => "no configuration for instance",
			RejectReason::InvalidPayload => "invalid register payload",
		})
	}
}

impl std::error::Error for RejectReason {}

/// Why an attempt ended without the supervisor asking it to.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
	Rejected(RejectReason),
	InitFailed(String),
	SpawnFailed(String),
	Exited(ChildExit),
	TimedOut,
}

impl fmt::Display for AttemptFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			AttemptFailure::Rejected(reason) => write!(f, "registration rejected: {}", reason),
			AttemptFailure::InitFailed(e) => write!(f, "init failed: {}", e),
			AttemptFailure::SpawnFailed(e) => write!(f, "spawn failed: {}", e),
			AttemptFailure::Exited(exit) => write!(f, "process exited ({})", exit),
			AttemptFailure::TimedOut => f.write_str("registration timed out"),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeState {
	Spawning,
	AwaitingRegister,
	Validating,
	Initializing,
	Ready,
	Failed(AttemptFailure),
	Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeEvent {
	Spawned,
	SpawnFailed(String),
	RegisterReceived,
	Accepted,
	Rejected(RejectReason),
	InitSucceeded,
	InitFailed(String),
	Exited(ChildExit),
	TimedOut,
	/// The supervisor stopped the process on purpose.
	Stop,
}

impl HandshakeState {
	pub fn is_terminal(&self) -> bool {
		matches!(self, HandshakeState::Failed(_) | HandshakeState::Stopped)
	}

	pub fn is_ready(&self) -> bool {
		matches!(self, HandshakeState::Ready)
	}

	/// Post-registration traffic is only routed to the handler from here on.
	pub fn is_registered(&self) -> bool {
		matches!(self, HandshakeState::Initializing | HandshakeState::Ready)
	}

	pub fn on(self, event: HandshakeEvent) -> HandshakeState {
		use HandshakeEvent as E;
		use HandshakeState as S;

		if self.is_terminal() {
			return self;
		}

		match (self, event) {
			(_, E::Stop) => S::Stopped,
			(S::Ready, E::Exited(_)) => S::Stopped,
			(_, E::Exited(exit)) => S::Failed(AttemptFailure::Exited(exit)),
			(S::Ready, E::TimedOut) => S::Ready,
			(_, E::TimedOut) => S::Failed(AttemptFailure::TimedOut),

			(S::Spawning, E::Spawned) => S::AwaitingRegister,
			(S::Spawning, E::SpawnFailed(e)) => S::Failed(AttemptFailure::SpawnFailed(e)),

			(S::AwaitingRegister, E::RegisterReceived) => S::Validating,
			(_, E::RegisterReceived) => S::Failed(AttemptFailure::Rejected(RejectReason::DuplicateRegister)),

			(S::Validating, E::Accepted) => S::Initializing,
			(S::Validating, E::Rejected(reason)) => S::Failed(AttemptFailure::Rejected(reason)),

			(S::Initializing, E::InitSucceeded) => S::Ready,
			(S::Initializing, E::InitFailed(e)) => S::Failed(AttemptFailure::InitFailed(e)),

			(state, event) => {
				tracing::debug!("ignoring {:?} in {:?}", event, state);
				state
			}
		}
	}
}

/// What a registration is checked against.
pub struct RegisterCheck<'a> {
	pub instance: &'a InstanceId,
	/// `None` once the attempt's token has been revoked.
	pub token: Option<&'a AuthToken>,
	pub host_api: ApiVersion,
}

pub fn parse_register(payload: Value) -> Result<RegisterMessage, RejectReason> {
	serde_json::from_value(payload).map_err(|_| RejectReason::InvalidPayload)
}

/// Returns the API version the child registered with.
pub fn validate_register(msg: &RegisterMessage, check: &RegisterCheck<'_>) -> Result<ApiVersion, RejectReason> {
	let token = check.token.ok_or(RejectReason::TokenMismatch)?;
	if !token.matches(&msg.verification_token) {
		return Err(RejectReason::TokenMismatch);
	}
	if msg.instance_id != check.instance.as_str() {
		return Err(RejectReason::InstanceMismatch);
	}
	let api: ApiVersion = msg
		.api_version
		.parse()
		.map_err(|_| RejectReason::IncompatibleApi)?;
	if !api.is_compatible_with(&check.host_api) {
		return Err(RejectReason::IncompatibleApi);
	}
	Ok(api)
}

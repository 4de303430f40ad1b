use serde::{Deserialize, Serialize};

/// Name of the first call a child must make after it starts.
pub const REGISTER_CALL: &str = "register";

/// Environment variable carrying the single-use token a child echoes back.
pub const VERIFICATION_TOKEN_ENV: &str = "VERIFICATION_TOKEN";

/// Environment variable carrying the absolute path of the module manifest.
pub const MODULE_MANIFEST_ENV: &str = "MODULE_MANIFEST";

pub const INSTANCE_ID_ENV: &str = "INSTANCE_ID";

pub const MODULE_TYPE_ENV: &str = "MODULE_TYPE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMessage {
	pub api_version: String,
	pub instance_id: String,
	pub verification_token: String,
}

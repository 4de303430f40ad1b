use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::api::ApiVersion;
use crate::registry::{Manifest, ModuleInfo};

/// The only runtime with a permission model we can drive from the command line.
pub const SANDBOXED_RUNTIME: &str = "node22";

/// Modules built against an older API predate sandboxing and run unrestricted.
pub const MIN_SANDBOXED_API: ApiVersion = ApiVersion::new(1, 12, 0);

/// Resolves where a module's runtime lives and how it should be invoked.
#[async_trait]
pub trait RuntimeLocator: Send + Sync {
	async fn resolve_runtime_binary(&self, runtime_type: &str) -> Option<PathBuf>;

	fn build_permission_args(
		&self,
		manifest: &Manifest,
		api_version: &ApiVersion,
		base_path: &Path,
		debug_inspect: bool,
	) -> Vec<String> {
		permission_args(manifest, api_version, base_path, debug_inspect)
	}

	/// Absolute path of the module entrypoint, if it exists inside the module.
	async fn resolve_entrypoint(&self, info: &ModuleInfo) -> Option<PathBuf> {
		let relative = Path::new(&info.manifest.runtime.entrypoint);
		let escapes = relative
			.components()
			.any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
		if relative.as_os_str().is_empty() || escapes {
			return None;
		}
		let path = info.base_path.join(relative);
		match tokio::fs::metadata(&path).await {
			Ok(m) if m.is_file() => Some(path),
			_ => None,
		}
	}
}

/// Runtimes shipped next to the host as `<dir>/<type>/bin/node`, plus any
/// explicit per-type overrides.
#[derive(Debug, Clone, Default)]
pub struct BundledRuntimes {
	dir: Option<PathBuf>,
	overrides: HashMap<String, PathBuf>,
}

impl BundledRuntimes {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self {
			dir: Some(dir.into()),
			overrides: HashMap::new(),
		}
	}

	pub fn with_override(mut self, runtime_type: impl Into<String>, binary: impl Into<PathBuf>) -> Self {
		self.overrides.insert(runtime_type.into(), binary.into());
		self
	}

	fn candidate(&self, runtime_type: &str) -> Option<PathBuf> {
		if let Some(path) = self.overrides.get(runtime_type) {
			return Some(path.clone());
		}
		self.dir
			.as_ref()
			.map(|dir| dir.join(runtime_type).join("bin").join("node"))
	}
}

#[async_trait]
impl RuntimeLocator for BundledRuntimes {
	async fn resolve_runtime_binary(&self, runtime_type: &str) -> Option<PathBuf> {
		let path = self.candidate(runtime_type)?;
		match tokio::fs::metadata(&path).await {
			Ok(m) if m.is_file() => Some(path),
			_ => {
				tracing::debug!("runtime {} not found at {}", runtime_type, path.display());
				None
			}
		}
	}
}

pub fn permission_args(
	manifest: &Manifest,
	api_version: &ApiVersion,
	base_path: &Path,
	debug_inspect: bool,
) -> Vec<String> {
	if manifest.runtime.runtime_type != SANDBOXED_RUNTIME || *api_version < MIN_SANDBOXED_API {
		return Vec::new();
	}

	let mut args = vec![
		"--permission".to_string(),
		format!("--allow-fs-read={}", base_path.display()),
	];

	let perms = &manifest.runtime.permissions;
	if perms.worker_threads {
		args.push("--allow-worker".to_string());
	}
	if perms.child_process {
		args.push("--allow-child-process".to_string());
	}
	if perms.native_addons {
		args.push("--allow-addons".to_string());
	}
	if perms.filesystem {
		args.push("--allow-fs-read=*".to_string());
		args.push("--allow-fs-write=*".to_string());
	}
	if debug_inspect {
		args.push("--allow-inspector".to_string());
	}
	args
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::api::ApiVersion;
use crate::types::ModuleType;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Marker file that flags a version directory as an unpackaged dev checkout.
pub const DEV_MARKER: &str = ".dev";

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
	pub id: String,
	#[serde(default)]
	pub name: String,
	pub version: String,
	pub runtime: RuntimeManifest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeManifest {
	#[serde(rename = "type")]
	pub runtime_type: String,
	pub api: ApiKind,
	#[serde(rename = "apiVersion")]
	pub api_version: String,
	pub entrypoint: String,
	#[serde(default)]
	pub permissions: Permissions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ApiKind {
	#[serde(rename = "nodejs-ipc")]
	NodejsIpc,
	#[serde(other)]
	Unsupported,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Permissions {
	#[serde(default)]
	pub worker_threads: bool,
	#[serde(default)]
	pub child_process: bool,
	#[serde(default)]
	pub native_addons: bool,
	#[serde(default)]
	pub filesystem: bool,
}

/// A resolved module version on disk.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
	pub manifest: Manifest,
	pub base_path: PathBuf,
	pub manifest_path: PathBuf,
	pub is_packaged: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("failed to read {path}: {source}")]
	Io {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("invalid manifest {path}: {source}")]
	Parse {
		path: PathBuf,
		source: serde_json::Error,
	},
	#[error("manifest {path} declares id {found:?}, expected {expected:?}")]
	IdMismatch {
		path: PathBuf,
		expected: String,
		found: String,
	},
}

/// Source of module manifests. Installation and validation of modules live
/// elsewhere; the supervisor only asks what is on disk.
#[async_trait]
pub trait ModuleRegistry: Send + Sync {
	/// Resolves a specific version, or the newest one when `version` is `None`.
	async fn resolve_version(
		&self,
		module_type: ModuleType,
		module_id: &str,
		version: Option<&str>,
	) -> Option<ModuleInfo>;

	async fn has_module(&self, module_type: ModuleType, module_id: &str) -> bool;
}

/// Registry backed by `<root>/<connections|surfaces>/<id>/<version>/manifest.json`.
#[derive(Debug, Clone)]
pub struct DirectoryRegistry {
	root: PathBuf,
}

impl DirectoryRegistry {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn module_dir(&self, module_type: ModuleType, module_id: &str) -> PathBuf {
		self.root.join(module_type.dir_name()).join(module_id)
	}

	/// Installed versions of one module, newest first.
	pub async fn versions(&self, module_type: ModuleType, module_id: &str) -> Vec<String> {
		let mut versions = subdirectories(&self.module_dir(module_type, module_id)).await;
		versions.sort_by(|a, b| compare_versions(b, a));
		versions
	}

	/// Every installed module of a type, with its versions newest first.
	pub async fn list_modules(&self, module_type: ModuleType) -> BTreeMap<String, Vec<String>> {
		let mut modules = BTreeMap::new();
		for module_id in subdirectories(&self.root.join(module_type.dir_name())).await {
			let versions = self.versions(module_type, &module_id).await;
			modules.insert(module_id, versions);
		}
		modules
	}

	pub async fn load(
		&self,
		module_type: ModuleType,
		module_id: &str,
		version: &str,
	) -> Result<ModuleInfo, RegistryError> {
		let base_path = self.module_dir(module_type, module_id).join(version);
		let manifest_path = base_path.join(MANIFEST_FILE);
		let content = tokio::fs::read_to_string(&manifest_path)
			.await
			.map_err(|source| RegistryError::Io {
				path: manifest_path.clone(),
				source,
			})?;
		let manifest: Manifest =
			serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
				path: manifest_path.clone(),
				source,
			})?;
		if manifest.id != module_id {
			return Err(RegistryError::IdMismatch {
				path: manifest_path,
				expected: module_id.to_string(),
				found: manifest.id,
			});
		}
		let is_packaged = !tokio::fs::try_exists(base_path.join(DEV_MARKER))
			.await
			.unwrap_or(false);
		Ok(ModuleInfo {
			manifest,
			base_path,
			manifest_path,
			is_packaged,
		})
	}
}

#[async_trait]
impl ModuleRegistry for DirectoryRegistry {
	async fn resolve_version(
		&self,
		module_type: ModuleType,
		module_id: &str,
		version: Option<&str>,
	) -> Option<ModuleInfo> {
		let version = match version {
			Some(v) => v.to_string(),
			None => self.versions(module_type, module_id).await.into_iter().next()?,
		};
		match self.load(module_type, module_id, &version).await {
			Ok(info) => Some(info),
			Err(RegistryError::Io { source, .. })
				if source.kind() == std::io::ErrorKind::NotFound =>
			{
				None
			}
			Err(e) => {
				tracing::warn!("{}", e);
				None
			}
		}
	}

	async fn has_module(&self, module_type: ModuleType, module_id: &str) -> bool {
		tokio::fs::metadata(self.module_dir(module_type, module_id))
			.await
			.map(|m| m.is_dir())
			.unwrap_or(false)
	}
}

async fn subdirectories(dir: &Path) -> Vec<String> {
	let mut names = Vec::new();
	let mut entries = match tokio::fs::read_dir(dir).await {
		Ok(e) => e,
		Err(_) => return names,
	};
	while let Ok(Some(entry)) = entries.next_entry().await {
		let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
		if !is_dir {
			continue;
		}
		if let Some(name) = entry.file_name().to_str() {
			if !name.starts_with('.') {
				names.push(name.to_string());
			}
		}
	}
	names
}

fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
	match (a.parse::<ApiVersion>(), b.parse::<ApiVersion>()) {
		(Ok(va), Ok(vb)) => va.cmp(&vb),
		(Ok(_), Err(_)) => std::cmp::Ordering::Greater,
		(Err(_), Ok(_)) => std::cmp::Ordering::Less,
		(Err(_), Err(_)) => a.cmp(b),
	}
}

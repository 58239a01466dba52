// src/sandbox/environment.rs
//! Installed language runtimes
//!
//! Each runtime type keeps its versions under `<versions_path>/<version>`. The
//! registry is read-mostly: lookups take the read lock, only `init` and
//! `install_environment` write. An install is staged in a hidden sibling
//! directory and renamed into place, so a version is never visible half-built.

use crate::utils::config::{EnvironmentsConfig, RuntimePaths};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

const STAGING_PREFIX: &str = ".staging-";

/// Supported runtime types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Python,
    Java,
}

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 2] = [RuntimeKind::Python, RuntimeKind::Java];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Python => "python",
            RuntimeKind::Java => "java",
        }
    }

    /// Binaries under `bin/` that make an installation usable
    pub fn binaries(&self) -> &'static [&'static str] {
        match self {
            RuntimeKind::Python => &["python3", "python"],
            RuntimeKind::Java => &["java"],
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "python" => Ok(RuntimeKind::Python),
            "java" => Ok(RuntimeKind::Java),
            other => Err(EngineError::InvalidArgument(format!(
                "unsupported runtime type: {}",
                other
            ))),
        }
    }
}

/// One installed runtime version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub kind: RuntimeKind,
    pub version: String,
    pub path: PathBuf,
    pub installed_at: DateTime<Utc>,
}

pub struct EnvironmentManager {
    config: EnvironmentsConfig,
    registry: RwLock<HashMap<(RuntimeKind, String), EnvironmentRecord>>,
}

impl EnvironmentManager {
    pub fn new(config: EnvironmentsConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(HashMap::new()),
        }
    }

    fn paths(&self, kind: RuntimeKind) -> &RuntimePaths {
        match kind {
            RuntimeKind::Python => &self.config.python,
            RuntimeKind::Java => &self.config.java,
        }
    }

    /// Create the directory layout and register versions already on disk
    pub fn init(&self) -> Result<()> {
        create_dir(&self.config.base_path)?;

        let mut found = Vec::new();
        for kind in RuntimeKind::ALL {
            let paths = self.paths(kind);
            create_dir(&paths.base_path)?;
            create_dir(&paths.installers_path)?;
            create_dir(&paths.versions_path)?;

            for entry in fs::read_dir(&paths.versions_path)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') || !entry.file_type()?.is_dir() {
                    continue;
                }
                let installed_at = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                found.push(EnvironmentRecord {
                    kind,
                    version: name,
                    path: entry.path(),
                    installed_at,
                });
            }
        }

        let mut registry = self.registry.write();
        for record in found {
            debug!(kind = %record.kind, version = %record.version, "Registered runtime");
            registry.insert((record.kind, record.version.clone()), record);
        }

        info!("Environment manager initialized with {} runtimes", registry.len());
        Ok(())
    }

    /// Installation directory of `kind` at `version`
    pub fn get_path(&self, kind: RuntimeKind, version: &str) -> Result<PathBuf> {
        check_version(version)?;

        if let Some(record) = self.registry.read().get(&(kind, version.to_string())) {
            return Ok(record.path.clone());
        }

        // Placed on disk by an operator since init
        let path = self.paths(kind).versions_path.join(version);
        if path.is_dir() {
            self.registry.write().insert(
                (kind, version.to_string()),
                EnvironmentRecord {
                    kind,
                    version: version.to_string(),
                    path: path.clone(),
                    installed_at: Utc::now(),
                },
            );
            return Ok(path);
        }

        Err(EngineError::EnvironmentNotFound {
            kind: kind.to_string(),
            version: version.to_string(),
        })
    }

    pub fn get_python_path(&self, version: &str) -> Result<PathBuf> {
        self.get_path(RuntimeKind::Python, version)
    }

    pub fn get_java_path(&self, version: &str) -> Result<PathBuf> {
        self.get_path(RuntimeKind::Java, version)
    }

    /// Path of the runtime's executable inside its `bin/` directory
    pub fn runtime_binary(&self, kind: RuntimeKind, version: &str) -> Result<PathBuf> {
        let root = self.get_path(kind, version)?;
        kind.binaries()
            .iter()
            .map(|name| root.join("bin").join(name))
            .find(|candidate| is_executable(candidate))
            .ok_or_else(|| {
                EngineError::Sandbox(format!(
                    "{} {} at {} has no executable bin/{}",
                    kind,
                    version,
                    root.display(),
                    kind.binaries()[0]
                ))
            })
    }

    /// True when the version is installed and its binary is executable
    pub fn validate_environment(&self, kind: RuntimeKind, version: &str) -> bool {
        match self.runtime_binary(kind, version) {
            Ok(_) => true,
            Err(e) => {
                debug!("Environment {} {} invalid: {}", kind, version, e);
                false
            }
        }
    }

    /// Install `version` from the installer artifact at `installer`.
    ///
    /// The artifact is copied into the version directory; unpacking it is left
    /// to the operator's tooling. Installing an existing version is a no-op.
    pub fn install_environment(
        &self,
        kind: RuntimeKind,
        version: &str,
        installer: &Path,
    ) -> Result<EnvironmentRecord> {
        check_version(version)?;

        if !installer.is_file() {
            return Err(EngineError::InvalidArgument(format!(
                "installer {} does not exist",
                installer.display()
            )));
        }

        let key = (kind, version.to_string());
        if let Some(existing) = self.registry.read().get(&key) {
            info!(kind = %kind, version, "Runtime already installed");
            return Ok(existing.clone());
        }

        let versions = &self.paths(kind).versions_path;
        let target = versions.join(version);
        if target.exists() {
            return Err(EngineError::Sandbox(format!(
                "{} exists but is not registered",
                target.display()
            )));
        }

        info!(kind = %kind, version, installer = %installer.display(), "Installing runtime");

        let staging = versions.join(format!("{}{}-{}", STAGING_PREFIX, version, ulid::Ulid::new()));
        let staged = stage_install(&staging, installer).and_then(|()| {
            fs::rename(&staging, &target).map_err(EngineError::from)
        });
        if let Err(e) = staged {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!("Failed to remove staging directory {:?}: {}", staging, cleanup);
            }
            return Err(e);
        }

        let record = EnvironmentRecord {
            kind,
            version: version.to_string(),
            path: target,
            installed_at: Utc::now(),
        };
        self.registry.write().insert(key, record.clone());

        info!(kind = %kind, version, path = %record.path.display(), "Runtime installed");
        Ok(record)
    }

    /// Every registered runtime, ordered by type then version
    pub fn list_environments(&self) -> Vec<EnvironmentRecord> {
        let mut records: Vec<_> = self.registry.read().values().cloned().collect();
        records.sort_by(|a, b| (a.kind, &a.version).cmp(&(b.kind, &b.version)));
        records
    }
}

fn stage_install(staging: &Path, installer: &Path) -> Result<()> {
    fs::create_dir_all(staging)?;
    let name = installer
        .file_name()
        .ok_or_else(|| EngineError::InvalidArgument("installer path has no file name".into()))?;
    fs::copy(installer, staging.join(name))?;
    Ok(())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| {
        EngineError::Sandbox(format!("failed to create {}: {}", path.display(), e))
    })
}

fn check_version(version: &str) -> Result<()> {
    if version.is_empty()
        || version.starts_with('.')
        || version.contains(std::path::is_separator)
    {
        return Err(EngineError::InvalidArgument(format!(
            "invalid runtime version '{}'",
            version
        )));
    }
    Ok(())
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn manager() -> (TempDir, EnvironmentManager) {
        let dir = tempdir().unwrap();
        let manager = EnvironmentManager::new(EnvironmentsConfig::under(dir.path()));
        manager.init().unwrap();
        (dir, manager)
    }

    fn fake_runtime(root: &Path, binary: &str, mode: u32) {
        let bin = root.join("bin");
        fs::create_dir_all(&bin).unwrap();
        let path = bin.join(binary);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("Python".parse::<RuntimeKind>().unwrap(), RuntimeKind::Python);
        assert_eq!("java".parse::<RuntimeKind>().unwrap(), RuntimeKind::Java);
        assert!("ruby".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn test_missing_version_not_found() {
        let (_dir, manager) = manager();
        let err = manager.get_python_path("3.99").unwrap_err();
        assert!(err.is_not_found());
        assert!(!manager.validate_environment(RuntimeKind::Java, "21"));
    }

    #[test]
    fn test_init_scans_existing_versions() {
        let dir = tempdir().unwrap();
        let config = EnvironmentsConfig::under(dir.path());
        fs::create_dir_all(config.python.versions_path.join("3.11")).unwrap();
        fs::create_dir_all(config.python.versions_path.join(".staging-3.12-x")).unwrap();

        let manager = EnvironmentManager::new(config);
        manager.init().unwrap();

        let listed = manager.list_environments();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].version, "3.11");
        assert_eq!(listed[0].kind, RuntimeKind::Python);
    }

    #[test]
    fn test_validate_requires_executable() {
        let (dir, manager) = manager();
        let root = dir.path().join("java").join("versions").join("17");

        fake_runtime(&root, "java", 0o644);
        assert!(manager.get_java_path("17").is_ok());
        assert!(!manager.validate_environment(RuntimeKind::Java, "17"));

        fake_runtime(&root, "java", 0o755);
        assert!(manager.validate_environment(RuntimeKind::Java, "17"));
    }

    #[test]
    fn test_install_stages_and_registers() {
        let (dir, manager) = manager();
        let installer = dir.path().join("python-3.12.tar.gz");
        fs::write(&installer, b"artifact").unwrap();

        let record = manager
            .install_environment(RuntimeKind::Python, "3.12", &installer)
            .unwrap();
        assert!(record.path.join("python-3.12.tar.gz").is_file());
        assert_eq!(manager.get_python_path("3.12").unwrap(), record.path);

        let leftovers: Vec<_> = fs::read_dir(record.path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(STAGING_PREFIX))
            .collect();
        assert!(leftovers.is_empty());

        let again = manager
            .install_environment(RuntimeKind::Python, "3.12", &installer)
            .unwrap();
        assert_eq!(again, record);
    }

    #[test]
    fn test_install_rejects_bad_input() {
        let (dir, manager) = manager();
        let missing = dir.path().join("nope.tar.gz");
        assert!(manager
            .install_environment(RuntimeKind::Java, "21", &missing)
            .is_err());

        let installer = dir.path().join("jdk.tar.gz");
        fs::write(&installer, b"artifact").unwrap();
        assert!(manager
            .install_environment(RuntimeKind::Java, "../escape", &installer)
            .is_err());
        assert!(manager.list_environments().is_empty());
    }
}

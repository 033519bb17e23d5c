//! Persisted target→bastion affinity hints.
//!
//! The hint map remembers which bastion last served a target so repeated
//! connects stay on the same path. Hints are never authoritative: the
//! resolver re-validates them against a fresh discovery result and silently
//! discards any that no longer hold.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::ConfigDiscovery;
use thiserror::Error;

use ortho_config::toml;

const APP_NAME: &str = "mist";
const CONFIG_ENV_VAR: &str = "MIST_CONFIG_PATH";
const CONFIG_FILE_NAME: &str = "mist.toml";
const DOTFILE_NAME: &str = ".mist.toml";
const PROJECT_FILE_NAME: &str = "mist.toml";
const AFFINITY_SECTION: &str = "affinity";

/// Errors raised while reading or updating the affinity map.
#[derive(Debug, Error)]
pub enum AffinityStoreError {
    /// Raised when no configuration candidates are available.
    #[error("no configuration file candidates were discovered")]
    NoCandidates,
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when parsing existing TOML content fails.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when existing TOML has an unexpected structure.
    #[error("invalid configuration in {path}: {message}")]
    InvalidStructure {
        /// Path that had invalid content.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Abstraction over affinity hint storage for dependency injection.
pub trait AffinityHints {
    /// Returns the hinted bastion identifier for a target, if present.
    ///
    /// # Errors
    ///
    /// Returns [`AffinityStoreError`] when the store cannot be read. Callers
    /// treat a failed read the same as an absent hint.
    fn hint_for(&self, target_id: &str) -> Result<Option<String>, AffinityStoreError>;

    /// Records the bastion that served a target, overwriting any prior hint.
    ///
    /// # Errors
    ///
    /// Returns [`AffinityStoreError`] when the store cannot be updated.
    fn record(&self, target_id: &str, bastion_id: &str) -> Result<Utf8PathBuf, AffinityStoreError>;
}

/// Updates `mist.toml` using `OrthoConfig`'s discovery search order.
#[derive(Clone, Debug)]
pub struct AffinityStore {
    discovery: ConfigDiscovery,
}

impl AffinityStore {
    /// Builds a store using the standard mist discovery settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            discovery: ConfigDiscovery::builder(APP_NAME)
                .env_var(CONFIG_ENV_VAR)
                .config_file_name(CONFIG_FILE_NAME)
                .dotfile_name(DOTFILE_NAME)
                .project_file_name(PROJECT_FILE_NAME)
                .build(),
        }
    }

    /// Builds a store using an explicit discovery configuration.
    #[must_use]
    pub const fn with_discovery(discovery: ConfigDiscovery) -> Self {
        Self { discovery }
    }

    fn resolve_target(&self) -> Result<StoreTarget, AffinityStoreError> {
        let candidates = self.discovery.utf8_candidates();
        if candidates.is_empty() {
            return Err(AffinityStoreError::NoCandidates);
        }

        for candidate in &candidates {
            if path_exists(candidate)? {
                return Ok(StoreTarget {
                    path: candidate.clone(),
                    exists: true,
                });
            }
        }

        let fallback = candidates
            .last()
            .cloned()
            .ok_or(AffinityStoreError::NoCandidates)?;
        Ok(StoreTarget {
            path: fallback,
            exists: false,
        })
    }
}

impl Default for AffinityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AffinityHints for AffinityStore {
    fn hint_for(&self, target_id: &str) -> Result<Option<String>, AffinityStoreError> {
        let target = self.resolve_target()?;
        if !target.exists {
            return Ok(None);
        }

        let contents = read_store(&target.path)?;
        let value = parse_toml(&target.path, &contents)?;
        read_hint(&target.path, &value, target_id)
    }

    fn record(&self, target_id: &str, bastion_id: &str) -> Result<Utf8PathBuf, AffinityStoreError> {
        let target = self.resolve_target()?;
        let contents = if target.exists {
            read_store(&target.path)?
        } else {
            String::new()
        };

        let mut value = parse_toml(&target.path, &contents)?;
        write_hint_value(&target.path, &mut value, target_id, bastion_id)?;
        write_store(&target.path, &value)?;
        Ok(target.path)
    }
}

#[derive(Clone, Debug)]
struct StoreTarget {
    path: Utf8PathBuf,
    exists: bool,
}

fn path_exists(path: &Utf8Path) -> Result<bool, AffinityStoreError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| AffinityStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration file path is missing a filename"),
        })?;

    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir
            .try_exists(file_name)
            .map_err(|err| AffinityStoreError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(AffinityStoreError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

fn read_store(path: &Utf8Path) -> Result<String, AffinityStoreError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| AffinityStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration file path is missing a filename"),
        })?;

    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
        AffinityStoreError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        }
    })?;

    dir.read_to_string(file_name)
        .map_err(|err| AffinityStoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

fn parse_toml(path: &Utf8Path, contents: &str) -> Result<toml::Value, AffinityStoreError> {
    if contents.trim().is_empty() {
        return Ok(toml::Value::Table(toml::value::Table::new()));
    }

    toml::from_str(contents).map_err(|err| AffinityStoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn read_hint(
    path: &Utf8Path,
    value: &toml::Value,
    target_id: &str,
) -> Result<Option<String>, AffinityStoreError> {
    let table = value
        .as_table()
        .ok_or_else(|| AffinityStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration root is not a table"),
        })?;

    let Some(section) = table.get(AFFINITY_SECTION) else {
        return Ok(None);
    };

    let section_table = section
        .as_table()
        .ok_or_else(|| AffinityStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: format!("[{AFFINITY_SECTION}] must be a table"),
        })?;

    section_table.get(target_id).map_or(Ok(None), |raw| {
        raw.as_str()
            .map(|id| Some(id.trim().to_owned()))
            .ok_or_else(|| AffinityStoreError::InvalidStructure {
                path: path.to_path_buf(),
                message: format!("{AFFINITY_SECTION}.{target_id} must be a string"),
            })
    })
}

fn write_hint_value(
    path: &Utf8Path,
    value: &mut toml::Value,
    target_id: &str,
    bastion_id: &str,
) -> Result<(), AffinityStoreError> {
    let table = value
        .as_table_mut()
        .ok_or_else(|| AffinityStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration root is not a table"),
        })?;

    let section = table
        .entry(String::from(AFFINITY_SECTION))
        .or_insert_with(|| toml::Value::Table(toml::value::Table::new()));

    let section_table =
        section
            .as_table_mut()
            .ok_or_else(|| AffinityStoreError::InvalidStructure {
                path: path.to_path_buf(),
                message: format!("[{AFFINITY_SECTION}] must be a table"),
            })?;

    section_table.insert(
        target_id.to_owned(),
        toml::Value::String(bastion_id.trim().to_owned()),
    );
    Ok(())
}

fn write_store(path: &Utf8Path, value: &toml::Value) -> Result<(), AffinityStoreError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| {
        AffinityStoreError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        }
    })?;

    let file_name = path
        .file_name()
        .ok_or_else(|| AffinityStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration file path is missing a filename"),
        })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
        AffinityStoreError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        }
    })?;

    let rendered = toml::to_string_pretty(value).map_err(|err| AffinityStoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    dir.write(file_name, rendered)
        .map_err(|err| AffinityStoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn discovery_for_path(path: &Utf8Path) -> ConfigDiscovery {
        let root = path
            .parent()
            .expect("temp path should have a parent directory");
        ConfigDiscovery::builder(APP_NAME)
            .env_var(CONFIG_ENV_VAR)
            .config_file_name(CONFIG_FILE_NAME)
            .dotfile_name(DOTFILE_NAME)
            .project_file_name(PROJECT_FILE_NAME)
            .clear_project_roots()
            .add_project_root(root)
            .build()
    }

    fn temp_store_path(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().join("mist.toml"))
            .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()))
    }

    #[test]
    fn record_creates_the_store_file() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_store_path(&tmp);
        let store = AffinityStore::with_discovery(discovery_for_path(&path));

        let written_path = store
            .record("srv-1", "gw-alpha")
            .unwrap_or_else(|err| panic!("record hint: {err}"));

        assert_eq!(written_path, path);
        let hint = store
            .hint_for("srv-1")
            .unwrap_or_else(|err| panic!("read hint: {err}"));
        assert_eq!(hint, Some(String::from("gw-alpha")));
    }

    #[test]
    fn hint_for_returns_none_without_a_store() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_store_path(&tmp);
        let store = AffinityStore::with_discovery(discovery_for_path(&path));

        let hint = store
            .hint_for("srv-1")
            .unwrap_or_else(|err| panic!("read hint: {err}"));
        assert_eq!(hint, None);
    }

    #[test]
    fn record_overwrites_previous_hints() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_store_path(&tmp);
        let store = AffinityStore::with_discovery(discovery_for_path(&path));
        store
            .record("srv-1", "gw-alpha")
            .unwrap_or_else(|err| panic!("seed hint: {err}"));

        store
            .record("srv-1", "gw-bravo")
            .unwrap_or_else(|err| panic!("overwrite hint: {err}"));

        let hint = store
            .hint_for("srv-1")
            .unwrap_or_else(|err| panic!("read hint: {err}"));
        assert_eq!(hint, Some(String::from("gw-bravo")));
    }

    #[test]
    fn hints_are_scoped_per_target() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_store_path(&tmp);
        let store = AffinityStore::with_discovery(discovery_for_path(&path));
        store
            .record("srv-1", "gw-alpha")
            .unwrap_or_else(|err| panic!("seed hint: {err}"));

        let hint = store
            .hint_for("srv-2")
            .unwrap_or_else(|err| panic!("read hint: {err}"));
        assert_eq!(hint, None);
    }
}

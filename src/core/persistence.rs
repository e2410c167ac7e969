use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::core::constants::{DEFAULT_MODEL, DEFAULT_TEMPERATURE, UNUSED_CREDENTIAL};
use crate::core::session::ChatSession;

pub const STATE_FILE_NAME: &str = "chat-storage.json";

/// Errors that can occur when reading or writing the state file.
#[derive(Debug)]
pub enum StateError {
    /// Failed to read the state file from disk.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The state file exists but does not contain valid JSON.
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Failed to write the state file.
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::Read { path, source } => {
                write!(f, "Failed to read state at {}: {}", path.display(), source)
            }
            StateError::Parse { path, source } => {
                write!(f, "Failed to parse state at {}: {}", path.display(), source)
            }
            StateError::Write { path, source } => {
                write!(f, "Failed to write state at {}: {}", path.display(), source)
            }
        }
    }
}

impl StdError for StateError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            StateError::Read { source, .. } | StateError::Write { source, .. } => Some(source),
            StateError::Parse { source, .. } => Some(source),
        }
    }
}

/// The single durable-storage record: the subset of store state that
/// survives restarts. Session message arrays live inside `chat_sessions`;
/// the active buffer is never persisted directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub selected_model: String,
    pub credential: String,
    pub temperature: f64,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub chat_sessions: Vec<ChatSession>,
    #[serde(default)]
    pub current_session_id: Option<String>,
}

impl Default for PersistedState {
    fn default() -> Self {
        PersistedState {
            selected_model: DEFAULT_MODEL.to_string(),
            credential: UNUSED_CREDENTIAL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            system_prompt: String::new(),
            chat_sessions: Vec::new(),
            current_session_id: None,
        }
    }
}

impl PersistedState {
    /// Load persisted state, returning defaults when no file exists yet.
    pub fn load_from_path(path: &Path) -> Result<PersistedState, StateError> {
        if !path.exists() {
            return Ok(PersistedState::default());
        }

        let contents = fs::read_to_string(path).map_err(|source| StateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| StateError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Atomically replace the state file: write to a temp file in the same
    /// directory, sync, then rename over the destination.
    pub fn save_to_path(&self, path: &Path) -> Result<(), StateError> {
        let write_err = |source: std::io::Error| StateError::Write {
            path: path.to_path_buf(),
            source,
        };

        let parent = path.parent().filter(|dir| !dir.as_os_str().is_empty());
        if let Some(dir) = parent {
            fs::create_dir_all(dir).map_err(write_err)?;
        }

        let contents = serde_json::to_string_pretty(self).map_err(|source| StateError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }
        .map_err(write_err)?;

        temp_file.write_all(contents.as_bytes()).map_err(write_err)?;
        temp_file.as_file_mut().sync_all().map_err(write_err)?;
        temp_file
            .persist(path)
            .map_err(|err| write_err(err.error))?;
        Ok(())
    }
}

/// Platform-appropriate location for the state file.
pub fn default_state_path() -> Option<PathBuf> {
    let proj_dirs = ProjectDirs::from("org", "permacommons", "palaver")?;
    Some(proj_dirs.data_dir().join(STATE_FILE_NAME))
}

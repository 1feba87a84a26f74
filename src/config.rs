use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Result, PROTOCOL_VERSION};

const DEFAULT_STORAGE_DIR: &str = "p2p-connect";
const DEFAULT_MAX_RESOURCES: usize = 10_000;

/// Settings of the sending role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Version proposed in the `ver.` message.
    pub protocol_version: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl SenderConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

/// Settings of the receiving role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// The only version accepted from a sender.
    pub protocol_version: u32,
    /// Directory received resources are persisted into.
    pub storage_dir: PathBuf,
    /// Largest resource count a sender may announce.
    pub max_resources: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            storage_dir: std::env::temp_dir().join(DEFAULT_STORAGE_DIR),
            max_resources: DEFAULT_MAX_RESOURCES,
        }
    }
}

impl ReceiverConfig {
    pub fn with_storage_dir(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }
}

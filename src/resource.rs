use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// One transferable resource.
///
/// The `id` is assigned by the sender and is the same on both devices. The
/// `location` points at readable bytes and differs between sender and
/// receiver: the receiver creates new descriptors pointing at its locally
/// persisted copies.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    id: String,
    #[serde(rename = "uri")]
    location: Url,
}

impl ResourceDescriptor {
    pub fn new(id: impl Into<String>, location: Url) -> Self {
        Self {
            id: id.into(),
            location,
        }
    }

    /// Describes the resource behind a URI string such as
    /// `file:///sdcard/Download/photo.jpg`.
    pub fn parse(id: impl Into<String>, uri: &str) -> Result<Self> {
        Ok(Self::new(id, Url::parse(uri)?))
    }

    /// Describes a file on the local filesystem. The path must be absolute.
    pub fn from_path(
        id: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let location = Url::from_file_path(path.as_ref()).map_err(|_| {
            Error::Other(anyhow::anyhow!(
                "not an absolute path: {}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::new(id, location))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn location(&self) -> &Url {
        &self.location
    }
}

/// Request to the receiving operator to accept or decline a transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptTransferRequest {
    pub transfer_id: String,
}

/// What the receiver hands back once every resource has been persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub transfer_id: String,
    pub resources: Vec<ResourceDescriptor>,
}

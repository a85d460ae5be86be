use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SIDECAR_NAME: &str = "info.json";

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("failed to access sidecar {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse sidecar {path}: {source}")]
    Parse {
        source: serde_json::Error,
        path: PathBuf,
    },
}

pub type SidecarResult<T> = std::result::Result<T, SidecarError>;

/// Session metadata captured at recording start and written once into the
/// session directory. The processor recovers stream identity from this
/// file, never from recorder memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionDescriptor {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
}

impl SessionDescriptor {
    pub fn write(&self, session_dir: &Path) -> SidecarResult<()> {
        let path = session_dir.join(SIDECAR_NAME);
        let contents = serde_json::to_vec_pretty(self).map_err(|source| SidecarError::Parse {
            source,
            path: path.clone(),
        })?;
        std::fs::write(&path, contents).map_err(|source| SidecarError::Io { source, path })
    }

    pub fn read(session_dir: &Path) -> SidecarResult<Self> {
        let path = session_dir.join(SIDECAR_NAME);
        let contents =
            std::fs::read_to_string(&path).map_err(|source| SidecarError::Io {
                source,
                path: path.clone(),
            })?;
        serde_json::from_str(&contents).map_err(|source| SidecarError::Parse { source, path })
    }

    /// Flat metadata snapshot stored alongside each delivery task.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "title": self.title,
            "uploader": self.uploader,
            "description": self.description,
        })
    }
}

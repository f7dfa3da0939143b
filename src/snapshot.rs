//! Crash-recovery snapshots of limiter windows and breaker records
//!
//! Snapshots are a convenience. A missing or unreadable file means a cold
//! start with empty windows and closed circuits.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::circuit::breaker::CircuitSnapshot;
use crate::error::GatewayResult;
use crate::ratelimit::limiter::WindowSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySnapshot {
    pub taken_at: DateTime<Utc>,
    #[serde(default)]
    pub windows: Vec<WindowSnapshot>,
    #[serde(default)]
    pub circuits: Vec<CircuitSnapshot>,
}

impl GatewaySnapshot {
    /// Write the snapshot atomically (temp file, then rename)
    pub async fn save(&self, path: &Path) -> GatewayResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(self)?;
        let tmp = temp_path(path);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;

        debug!(
            "Saved snapshot to {} ({} windows, {} circuits)",
            path.display(),
            self.windows.len(),
            self.circuits.len()
        );
        Ok(())
    }

    /// Read a snapshot; `Ok(None)` when the file does not exist
    pub async fn load(path: &Path) -> GatewayResult<Option<Self>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {}, starting cold", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: GatewaySnapshot = serde_json::from_slice(&bytes)?;
        info!(
            "Loaded snapshot from {} taken at {}",
            path.display(),
            snapshot.taken_at
        );
        Ok(Some(snapshot))
    }

    /// [`load`](Self::load), logging and discarding any error
    pub async fn load_or_cold(path: &Path) -> Option<Self> {
        match Self::load(path).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring unreadable snapshot {}: {}", path.display(), e);
                None
            }
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

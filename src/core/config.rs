//! Engine configuration
//!
//! Persisted as JSON so an embedding application can keep tile-server and
//! download settings next to its cache directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tile URL template; `{s}` is replaced by a rotating subdomain label,
    /// `{z}`/`{x}`/`{y}` by the tile address.
    pub url_template: String,
    /// Mirror subdomain labels cycled round-robin across requests
    pub subdomains: Vec<String>,
    /// Root directory of the on-disk tile cache
    pub cache_dir: PathBuf,
    /// Edge length of a tile in pixels
    pub tile_size: u32,
    /// Viewport extent in tiles
    pub viewport_tiles_x: u32,
    pub viewport_tiles_y: u32,
    /// Maximum simultaneous fetch requests
    pub max_concurrent: usize,
    /// Maximum attempts per tile before a transient failure becomes terminal
    pub retry_max: u32,
    /// Initial retry backoff in milliseconds; doubles per attempt
    pub backoff_initial_ms: u64,
    /// Extra ring of tiles kept around the viewport before eviction
    pub cleanup_margin: u32,
    /// Fetch missing viewport tiles as the view moves
    pub browse_download: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url_template: "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            subdomains: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            cache_dir: PathBuf::from("tilemap"),
            tile_size: 256,
            viewport_tiles_x: 5,
            viewport_tiles_y: 5,
            max_concurrent: 8,
            retry_max: 3,
            backoff_initial_ms: 3000,
            cleanup_margin: 2,
            browse_download: true,
        }
    }
}

impl EngineConfig {
    /// Loads a configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Saves the configuration as pretty-printed JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

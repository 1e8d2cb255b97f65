//! On-disk tile cache
//!
//! One file per tile under `{root}/{z}/{x}/{y}.png`. The directory structure
//! is the only persisted state; absence of a file is the only "not cached"
//! signal.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::core::geo::{TileCoord, MAX_ZOOM};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct TileStore {
    root: PathBuf,
}

impl TileStore {
    /// Opens the store, creating the root directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic file path for a tile
    pub fn path_for(&self, coord: TileCoord) -> PathBuf {
        self.root
            .join(coord.z.to_string())
            .join(coord.x.to_string())
            .join(format!("{}.png", coord.y))
    }

    pub fn exists(&self, coord: TileCoord) -> bool {
        self.path_for(coord).is_file()
    }

    /// Persists a tile, creating intermediate directories as needed
    pub fn save(&self, coord: TileCoord, bytes: &[u8]) -> Result<()> {
        write_tile(&self.path_for(coord), bytes)
    }

    /// Reads a tile fully; a missing or empty file is an error
    pub fn load(&self, coord: TileCoord) -> Result<Vec<u8>> {
        read_tile(&self.path_for(coord))
    }

    /// Highest zoom level with at least one cached tile, if any
    pub fn max_available_zoom(&self) -> Option<u8> {
        self.populated_zooms().into_iter().max()
    }

    /// Cached tile count per populated zoom level, sorted by zoom
    pub fn zoom_inventory(&self) -> Vec<(u8, usize)> {
        let mut inventory: Vec<(u8, usize)> = self
            .populated_zooms()
            .into_iter()
            .map(|zoom| (zoom, self.count_tiles(zoom)))
            .collect();
        inventory.sort_by_key(|&(zoom, _)| zoom);
        inventory
    }

    /// Zoom levels whose directories contain at least one tile file
    fn populated_zooms(&self) -> Vec<u8> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let zoom: u8 = entry.file_name().to_str()?.parse().ok()?;
                if zoom <= MAX_ZOOM && self.count_tiles(zoom) > 0 {
                    Some(zoom)
                } else {
                    None
                }
            })
            .collect()
    }

    fn count_tiles(&self, zoom: u8) -> usize {
        let zoom_dir = self.root.join(zoom.to_string());
        let Ok(columns) = fs::read_dir(zoom_dir) else {
            return 0;
        };
        columns
            .flatten()
            .filter(|column| column.file_name().to_str().map_or(false, |name| name.parse::<u32>().is_ok()))
            .filter_map(|column| fs::read_dir(column.path()).ok())
            .map(|files| {
                files
                    .flatten()
                    .filter(|file| {
                        file.path().extension().map_or(false, |ext| ext == "png")
                    })
                    .count()
            })
            .sum()
    }
}

/// Writes a full byte buffer to `path`, creating parent directories. A short
/// write is reported as an error, not a silent truncation.
pub(crate) fn write_tile(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    let written = fs::metadata(path)?.len();
    if written != bytes.len() as u64 {
        return Err(Error::Store(format!(
            "short write to {}: {} of {} bytes",
            path.display(),
            written,
            bytes.len()
        )));
    }
    debug!("saved {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

/// Reads a tile file fully; an empty file is an error, not an empty success
pub(crate) fn read_tile(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path)?;
    if bytes.is_empty() {
        return Err(Error::Store(format!("empty tile file: {}", path.display())));
    }
    Ok(bytes)
}

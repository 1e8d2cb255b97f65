//! # tilekeep
//!
//! A slippy-map tile acquisition and caching engine.
//!
//! Given a geographic region and a zoom range, the engine determines which
//! raster tiles are needed, fetches missing tiles from a remote tile server
//! (or loads them from the local on-disk cache), persists newly fetched
//! tiles, and reports aggregate progress to the consumer. Rendering and UI
//! concerns are left to the embedding application: it feeds commands in
//! ([`TileEngine::set_center`], [`TileEngine::set_zoom`],
//! [`TileEngine::download_region`]) and drains [`EngineEvent`]s and decoded
//! tile images out.

pub mod core;
pub mod engine;
pub mod fetch;
pub mod prelude;
pub mod store;

// Re-export public API
pub use crate::core::{
    config::EngineConfig,
    geo::{LatLng, Point, TileCoord},
    viewport::{TileWindow, Viewport},
};

pub use crate::engine::{
    events::EngineEvent,
    orchestrator::{DisplayedTile, TileEngine},
};

pub use crate::fetch::{
    retry::RetryPolicy,
    source::{SlippyTileSource, TileSource},
};

pub use crate::store::{disk::TileStore, memory::ImageCache};

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Image decode error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Invalid coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("Cache store error: {0}")]
    Store(String),

    #[error("Fetch error: {0}")]
    Fetch(String),
}

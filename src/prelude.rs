//! Prelude module for common tilekeep types
//!
//! Re-exports the most commonly used types and functions for easy importing
//! with `use tilekeep::prelude::*;`

pub use crate::core::{
    config::EngineConfig,
    geo::{lat_lon_to_tile, tile_to_lat_lon, LatLng, Point, TileCoord},
    viewport::{TileWindow, Viewport},
};

pub use crate::engine::{
    events::EngineEvent,
    orchestrator::{DisplayedTile, TileEngine},
};

pub use crate::fetch::{
    retry::RetryPolicy,
    source::{SlippyTileSource, TileSource},
    worker::{FetchOutcome, FetchResult, FetchTask, RequestKind},
};

pub use crate::store::{disk::TileStore, memory::ImageCache};

pub use crate::{Error, Result};

pub use std::{
    sync::Arc,
    time::{Duration, Instant},
};

pub use fxhash::{FxHashMap as HashMap, FxHashSet as HashSet};

//! Viewport state and tile-window math
//!
//! The viewport is the rectangular set of tile indices currently intended
//! for display, centered on the geographic center. All scene positions are
//! derived from it and never persisted: a tile's offset is always recomputed
//! relative to the tile containing the current center.

use crate::core::geo::{lat_lon_to_tile, LatLng, Point, TileCoord, MAX_ZOOM};

/// Current view parameters owned by the orchestrator
#[derive(Debug, Clone)]
pub struct Viewport {
    pub center: LatLng,
    pub zoom: u8,
    pub tile_size: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
}

impl Viewport {
    pub fn new(center: LatLng, zoom: u8, tile_size: u32, tiles_x: u32, tiles_y: u32) -> Self {
        Self {
            center,
            zoom: zoom.min(MAX_ZOOM),
            tile_size,
            tiles_x: tiles_x.max(1),
            tiles_y: tiles_y.max(1),
        }
    }

    /// The tile containing the current center
    pub fn center_tile(&self) -> TileCoord {
        TileCoord::from_lat_lng(&self.center, self.zoom)
    }

    /// The visible tile window, expanded by `margin` tiles on every side and
    /// clamped to the grid
    pub fn window(&self, margin: i64) -> TileWindow {
        let center = self.center_tile();
        let half_x = (self.tiles_x / 2) as i64;
        let half_y = (self.tiles_y / 2) as i64;
        let max = TileCoord::max_index(self.zoom) as i64;
        TileWindow {
            min_x: (center.x as i64 - half_x - margin).clamp(0, max) as u32,
            min_y: (center.y as i64 - half_y - margin).clamp(0, max) as u32,
            max_x: (center.x as i64 + half_x + margin).clamp(0, max) as u32,
            max_y: (center.y as i64 + half_y + margin).clamp(0, max) as u32,
            zoom: self.zoom,
        }
    }

    /// Scene offset of a tile relative to the center tile:
    /// `(index - center_index + viewport_half) * tile_size`
    pub fn placement(&self, coord: TileCoord) -> Point {
        let center = self.center_tile();
        let half_x = (self.tiles_x / 2) as f64;
        let half_y = (self.tiles_y / 2) as f64;
        Point::new(
            (coord.x as f64 - center.x as f64 + half_x) * self.tile_size as f64,
            (coord.y as f64 - center.y as f64 + half_y) * self.tile_size as f64,
        )
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(LatLng::new(39.9042, 116.4074), 10, 256, 5, 5)
    }
}

/// An inclusive rectangle of tile indices at one zoom level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileWindow {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
    pub zoom: u8,
}

impl TileWindow {
    /// Tile-index bounding box covering a geographic box at `zoom`.
    ///
    /// Increasing latitude decreases tile-Y, so the projected corners are
    /// swapped into canonical min/max order before clamping.
    pub fn covering(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64, zoom: u8) -> Self {
        let (x0, y0) = lat_lon_to_tile(max_lat, min_lon, zoom);
        let (x1, y1) = lat_lon_to_tile(min_lat, max_lon, zoom);
        let (min_x, max_x) = if x0 <= x1 { (x0, x1) } else { (x1, x0) };
        let (min_y, max_y) = if y0 <= y1 { (y0, y1) } else { (y1, y0) };
        let max = TileCoord::max_index(zoom) as i64;
        Self {
            min_x: min_x.clamp(0, max) as u32,
            min_y: min_y.clamp(0, max) as u32,
            max_x: max_x.clamp(0, max) as u32,
            max_y: max_y.clamp(0, max) as u32,
            zoom,
        }
    }

    pub fn contains(&self, coord: TileCoord) -> bool {
        coord.z == self.zoom
            && coord.x >= self.min_x
            && coord.x <= self.max_x
            && coord.y >= self.min_y
            && coord.y <= self.max_y
    }

    /// Number of tiles in the window (inclusive bounds, so never zero)
    pub fn count(&self) -> usize {
        ((self.max_x - self.min_x) as usize + 1) * ((self.max_y - self.min_y) as usize + 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = TileCoord> {
        let w = *self;
        (w.min_x..=w.max_x)
            .flat_map(move |x| (w.min_y..=w.max_y).map(move |y| TileCoord::new(x, y, w.zoom)))
    }
}

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// Web Mercator clips latitude here; beyond this the projection diverges.
pub const MAX_LATITUDE: f64 = 85.0511287798;

/// Highest zoom level the engine will address.
pub const MAX_ZOOM: u8 = 19;

/// Represents a geographical coordinate with latitude and longitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    /// Creates a new LatLng coordinate
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Validates that the coordinates are within valid ranges
    pub fn is_valid(&self) -> bool {
        self.lat >= -90.0 && self.lat <= 90.0 && self.lng >= -180.0 && self.lng <= 180.0
    }

    /// Wraps longitude to [-180, 180] range
    pub fn wrap_lng(lng: f64) -> f64 {
        let wrapped = lng % 360.0;
        if wrapped > 180.0 {
            wrapped - 360.0
        } else if wrapped < -180.0 {
            wrapped + 360.0
        } else {
            wrapped
        }
    }

    /// Clamps latitude to the projectable range
    pub fn clamp_lat(lat: f64) -> f64 {
        lat.clamp(-MAX_LATITUDE, MAX_LATITUDE)
    }
}

impl Default for LatLng {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// Represents a point in scene coordinates (pixels)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Maps (lat, lon) to unclamped tile indices at `zoom` using the standard
/// slippy-map projection. Indices for latitudes outside the Mercator domain
/// fall outside `[0, 2^zoom - 1]`; callers clamp.
pub fn lat_lon_to_tile(lat: f64, lon: f64, zoom: u8) -> (i64, i64) {
    let lat_rad = lat.to_radians();
    let n = (1i64 << zoom) as f64;
    let x = ((lon + 180.0) / 360.0 * n).floor() as i64;
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n).floor() as i64;
    (x, y)
}

/// Inverse of [`lat_lon_to_tile`]: the northwest corner of tile (x, y).
pub fn tile_to_lat_lon(x: i64, y: i64, zoom: u8) -> (f64, f64) {
    let n = (1i64 << zoom) as f64;
    let lon = x as f64 / n * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * y as f64 / n)).sinh().atan().to_degrees();
    (lat, lon)
}

/// Represents a tile coordinate in the slippy map tile system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileCoord {
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Largest valid tile index at `zoom`
    pub fn max_index(zoom: u8) -> u32 {
        (1u32 << zoom.min(MAX_ZOOM)) - 1
    }

    /// Creates a tile coordinate from a LatLng and zoom level, clamped to
    /// the valid grid for that zoom
    pub fn from_lat_lng(lat_lng: &LatLng, zoom: u8) -> Self {
        let (x, y) = lat_lon_to_tile(LatLng::clamp_lat(lat_lng.lat), lat_lng.lng, zoom);
        let max = Self::max_index(zoom) as i64;
        Self::new(x.clamp(0, max) as u32, y.clamp(0, max) as u32, zoom)
    }

    /// Converts tile coordinate to LatLng (northwest corner)
    pub fn to_lat_lng(&self) -> LatLng {
        let (lat, lng) = tile_to_lat_lon(self.x as i64, self.y as i64, self.z);
        LatLng::new(lat, lng)
    }

    /// Checks if the tile is valid for its zoom level
    pub fn is_valid(&self) -> bool {
        self.x <= Self::max_index(self.z) && self.y <= Self::max_index(self.z)
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lat_lng_creation() {
        let coord = LatLng::new(40.7128, -74.0060);
        assert_eq!(coord.lat, 40.7128);
        assert_eq!(coord.lng, -74.0060);
        assert!(coord.is_valid());
    }

    #[test]
    fn test_wrap_lng() {
        assert_eq!(LatLng::wrap_lng(190.0), -170.0);
        assert_eq!(LatLng::wrap_lng(-200.0), 160.0);
        assert_eq!(LatLng::wrap_lng(116.4), 116.4);
    }

    #[test]
    fn test_known_tile_index() {
        // Beijing at zoom 10 lands on the well-known OSM tile 843/388
        let (x, y) = lat_lon_to_tile(39.9042, 116.4074, 10);
        assert_eq!((x, y), (843, 388));
    }

    #[test]
    fn test_equator_prime_meridian() {
        let (x, y) = lat_lon_to_tile(0.0, 0.0, 1);
        assert_eq!((x, y), (1, 1));
    }

    #[test]
    fn test_round_trip_within_one_tile() {
        let lats = [-80.0, -45.0, -10.0, 0.0, 30.0, 60.0, 84.9];
        let lngs = [-179.0, -90.0, 0.0, 116.4074, 179.0];
        for zoom in [1u8, 4, 8, 12, 16] {
            let n = (1i64 << zoom) as f64;
            for &lat in &lats {
                for &lng in &lngs {
                    let (x, y) = lat_lon_to_tile(lat, lng, zoom);
                    let (rlat, rlng) = tile_to_lat_lon(x, y, zoom);
                    // recovering the corner and re-projecting must land on
                    // the same tile
                    let (x2, y2) = lat_lon_to_tile(
                        (rlat - 1e-9).max(-MAX_LATITUDE),
                        rlng + 1e-9,
                        zoom,
                    );
                    assert_eq!((x, y), (x2, y2), "lat={lat} lng={lng} z={zoom}");
                    // corner within one tile's angular span of the input
                    assert!((rlng - lng).abs() <= 360.0 / n + 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_from_lat_lng_always_in_bounds() {
        let extremes = [
            (89.9, 0.0),
            (-89.9, 0.0),
            (45.0, 180.0),
            (45.0, -180.0),
            (0.0, 0.0),
        ];
        for zoom in 0..=MAX_ZOOM {
            for &(lat, lng) in &extremes {
                let tile = TileCoord::from_lat_lng(&LatLng::new(lat, lng), zoom);
                assert!(tile.is_valid(), "tile {tile} out of range");
            }
        }
    }

    #[test]
    fn test_display_is_z_x_y() {
        assert_eq!(TileCoord::new(843, 388, 10).to_string(), "10/843/388");
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::geo::TileCoord;

/// Trait representing anything that can produce tile URLs for a given coordinate.
pub trait TileSource: Send + Sync {
    /// Build a URL for the requested `coord`.
    fn url(&self, coord: TileCoord) -> String;
}

/// URL-template source with round-robin subdomain rotation.
///
/// `{z}`/`{x}`/`{y}` are replaced with the tile address; `{s}` cycles
/// through the configured subdomain labels to spread load across mirror
/// servers, independent of any retry state.
pub struct SlippyTileSource {
    template: String,
    subdomains: Vec<String>,
    next_subdomain: AtomicUsize,
}

impl SlippyTileSource {
    pub fn new(template: impl Into<String>, subdomains: Vec<String>) -> Self {
        Self {
            template: template.into(),
            subdomains,
            next_subdomain: AtomicUsize::new(0),
        }
    }

    /// Default OpenStreetMap tile server with the standard mirror labels
    pub fn osm() -> Self {
        Self::new(
            "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png",
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
        )
    }
}

impl TileSource for SlippyTileSource {
    fn url(&self, coord: TileCoord) -> String {
        let mut url = self
            .template
            .replace("{z}", &coord.z.to_string())
            .replace("{x}", &coord.x.to_string())
            .replace("{y}", &coord.y.to_string());

        if url.contains("{s}") && !self.subdomains.is_empty() {
            let idx = self.next_subdomain.fetch_add(1, Ordering::Relaxed) % self.subdomains.len();
            url = url.replace("{s}", &self.subdomains[idx]);
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_substitution() {
        let source = SlippyTileSource::new("http://host/{z}/{x}/{y}.png", Vec::new());
        assert_eq!(
            source.url(TileCoord::new(843, 388, 10)),
            "http://host/10/843/388.png"
        );
    }

    #[test]
    fn test_subdomains_rotate_round_robin() {
        let source = SlippyTileSource::osm();
        let coord = TileCoord::new(0, 0, 0);
        let hosts: Vec<String> = (0..4).map(|_| source.url(coord)).collect();
        assert!(hosts[0].starts_with("https://a."));
        assert!(hosts[1].starts_with("https://b."));
        assert!(hosts[2].starts_with("https://c."));
        assert!(hosts[3].starts_with("https://a."));
    }

    #[test]
    fn test_template_without_subdomain_placeholder() {
        let source = SlippyTileSource::new(
            "https://tiles.example.com/{z}/{x}/{y}.png",
            vec!["a".to_string()],
        );
        assert_eq!(
            source.url(TileCoord::new(1, 2, 3)),
            "https://tiles.example.com/3/1/2.png"
        );
    }
}

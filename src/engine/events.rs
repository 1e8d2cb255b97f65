/// Outbound events consumed by the embedding application.
///
/// The engine reports aggregate progress only; individual tile failures
/// surface as gaps in coverage, never as per-tile errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Progress of the active region download; `zoom` is the level of the
    /// tile that just resolved
    RegionProgress {
        current: usize,
        total: usize,
        zoom: u8,
    },
    /// The region download session completed; fires exactly once per session
    DownloadFinished,
    /// A populated cache was found and its viewport tiles loaded
    LocalTilesFound { zoom: u8, count: usize },
    /// The cache root holds no usable tiles
    NoLocalTilesFound,
}

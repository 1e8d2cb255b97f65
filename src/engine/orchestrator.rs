//! Tile orchestrator
//!
//! Owns the viewport, the pending-request queue, the displayed-tile table,
//! and region-download bookkeeping. All state mutation happens on the
//! caller's thread; worker results cross back into this domain only through
//! the result channel, drained inside [`TileEngine::pump`]. The embedding
//! application drives the engine by calling `pump` on a short tick (the
//! original debounced-poll design) and reading events off the event channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use fxhash::{FxHashMap, FxHashSet};
use image::RgbaImage;
use log::{debug, warn};

use crate::core::config::EngineConfig;
use crate::core::geo::{LatLng, Point, TileCoord, MAX_ZOOM};
use crate::core::viewport::{TileWindow, Viewport};
use crate::engine::events::EngineEvent;
use crate::fetch::retry::RetryPolicy;
use crate::fetch::source::{SlippyTileSource, TileSource};
use crate::fetch::worker::{FetchOutcome, FetchResult, FetchTask, FetchWorker, RequestKind};
use crate::store::disk::TileStore;
use crate::store::memory::ImageCache;
use crate::Result;

/// Pump rounds a fully-resolved session may sit on phantom in-flight
/// requests before completion is forced. Liveness guard only; it cannot
/// fire while results are still owed.
const STALL_LIMIT: u32 = 50;

/// A decoded tile positioned relative to the current center tile
#[derive(Debug, Clone)]
pub struct DisplayedTile {
    pub coord: TileCoord,
    pub offset: Point,
    pub image: Arc<RgbaImage>,
}

/// Bookkeeping for one region-download session
#[derive(Debug)]
struct RegionSession {
    total: usize,
    completed: usize,
    failed: usize,
    in_flight: usize,
    finished_emitted: bool,
    stall_ticks: u32,
}

impl RegionSession {
    fn resolved(&self) -> usize {
        self.completed + self.failed
    }
}

pub struct TileEngine {
    config: EngineConfig,
    viewport: Viewport,
    store: TileStore,
    source: Box<dyn TileSource>,
    images: ImageCache,

    task_tx: Option<Sender<FetchTask>>,
    result_rx: Receiver<FetchResult>,
    event_tx: Sender<EngineEvent>,
    event_rx: Receiver<EngineEvent>,

    pending: VecDeque<FetchTask>,
    queued_keys: FxHashSet<TileCoord>,
    in_flight: usize,
    /// Bumped on every zoom change and region download; results tagged with
    /// an older generation are discarded
    generation: u64,
    session: Option<RegionSession>,

    displayed: FxHashMap<TileCoord, DisplayedTile>,
    display_attached: bool,

    worker: Option<FetchWorker>,
}

impl TileEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let store = TileStore::open(&config.cache_dir)?;
        let source: Box<dyn TileSource> = Box::new(SlippyTileSource::new(
            &config.url_template,
            config.subdomains.clone(),
        ));

        let (task_tx, task_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        let policy = RetryPolicy::new(
            config.retry_max,
            Duration::from_millis(config.backoff_initial_ms),
        );
        let worker = FetchWorker::start(policy, config.max_concurrent, task_rx, result_tx);

        let viewport = Viewport::new(
            LatLng::new(39.9042, 116.4074),
            10,
            config.tile_size,
            config.viewport_tiles_x,
            config.viewport_tiles_y,
        );

        Ok(Self {
            config,
            viewport,
            store,
            source,
            images: ImageCache::with_default_capacity(),
            task_tx: Some(task_tx),
            result_rx,
            event_tx,
            event_rx,
            pending: VecDeque::new(),
            queued_keys: FxHashSet::default(),
            in_flight: 0,
            generation: 0,
            session: None,
            displayed: FxHashMap::default(),
            display_attached: false,
            worker: Some(worker),
        })
    }

    /// The outbound event stream. Single-consumer: take one receiver and
    /// poll it alongside [`TileEngine::pump`].
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.event_rx.clone()
    }

    /// Enables the displayed-tile table and loads the current window
    pub fn attach_display(&mut self) {
        self.display_attached = true;
        self.load_visible_tiles();
    }

    pub fn zoom(&self) -> u8 {
        self.viewport.zoom
    }

    pub fn center(&self) -> LatLng {
        self.viewport.center
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// (completed, total) of the active region session, if any
    pub fn region_progress(&self) -> Option<(usize, usize)> {
        self.session
            .as_ref()
            .map(|session| (session.completed, session.total))
    }

    pub fn displayed_tiles(&self) -> impl Iterator<Item = &DisplayedTile> {
        self.displayed.values()
    }

    pub fn store(&self) -> &TileStore {
        &self.store
    }

    /// Swaps the tile URL template; subdomain labels are kept
    pub fn set_tile_source(&mut self, template: &str) {
        self.source = Box::new(SlippyTileSource::new(
            template,
            self.config.subdomains.clone(),
        ));
    }

    /// Moves the viewport center and loads any tiles newly in view. No
    /// network activity beyond the viewport window.
    pub fn set_center(&mut self, lat: f64, lon: f64) {
        self.viewport.center = LatLng::new(LatLng::clamp_lat(lat), LatLng::wrap_lng(lon));
        self.cleanup_tiles();
        self.reposition_tiles();
        self.load_visible_tiles();
    }

    /// Changes the zoom level. Tiles from other zoom levels are evicted
    /// (their scene position is zoom-dependent), remaining tiles are
    /// repositioned, and any in-progress region download is invalidated.
    pub fn set_zoom(&mut self, zoom: u8) {
        let zoom = zoom.min(MAX_ZOOM);
        debug!("zoom {} -> {zoom}", self.viewport.zoom);
        self.viewport.zoom = zoom;
        self.abandon_session();
        self.cleanup_tiles();
        self.reposition_tiles();
        self.load_visible_tiles();
    }

    /// Enumerates and fetches every tile covering the geographic box across
    /// `[min_zoom, max_zoom]`. Already-cached tiles count toward progress
    /// immediately and are never enqueued; if nothing is missing the session
    /// completes on the spot.
    pub fn download_region(
        &mut self,
        min_lat: f64,
        max_lat: f64,
        min_lon: f64,
        max_lon: f64,
        min_zoom: u8,
        max_zoom: u8,
    ) {
        self.abandon_session();
        let min_zoom = min_zoom.min(MAX_ZOOM);
        let max_zoom = max_zoom.min(MAX_ZOOM);

        let mut total = 0usize;
        let mut cached = 0usize;
        for zoom in min_zoom..=max_zoom {
            let window = TileWindow::covering(min_lat, max_lat, min_lon, max_lon, zoom);
            total += window.count();
            let mut missing = 0usize;
            for coord in window.iter() {
                if self.store.exists(coord) {
                    cached += 1;
                } else {
                    self.enqueue(coord, RequestKind::Region);
                    missing += 1;
                }
            }
            debug!(
                "zoom {zoom}: box ({},{})..({},{}) = {} tiles, {missing} missing",
                window.min_x,
                window.min_y,
                window.max_x,
                window.max_y,
                window.count(),
            );
        }

        let mut session = RegionSession {
            total,
            completed: cached,
            failed: 0,
            in_flight: 0,
            finished_emitted: false,
            stall_ticks: 0,
        };
        debug!("region download: {total} tiles, {cached} already cached");

        if cached > 0 {
            let _ = self.event_tx.send(EngineEvent::RegionProgress {
                current: cached,
                total,
                zoom: min_zoom,
            });
        }
        if session.completed >= total {
            session.finished_emitted = true;
            self.session = Some(session);
            let _ = self.event_tx.send(EngineEvent::DownloadFinished);
            return;
        }
        self.session = Some(session);
        self.dispatch();
    }

    /// Scans the cache root for the highest populated zoom level and loads
    /// its viewport tiles from disk, with no network activity.
    pub fn check_local_tiles(&mut self) {
        let Some(zoom) = self.store.max_available_zoom() else {
            debug!("no cached tiles under {}", self.store.root().display());
            let _ = self.event_tx.send(EngineEvent::NoLocalTilesFound);
            return;
        };
        self.viewport.zoom = zoom;
        self.abandon_session();
        self.cleanup_tiles();
        let count = self.load_local_window();
        debug!("found local tiles at zoom {zoom}, {count} in view");
        let _ = self.event_tx.send(EngineEvent::LocalTilesFound { zoom, count });
    }

    /// Highest zoom level with cached tiles, 0 when the cache is empty
    pub fn max_available_zoom(&self) -> u8 {
        self.store.max_available_zoom().unwrap_or(0)
    }

    /// Cached tile count per populated zoom level
    pub fn zoom_inventory(&self) -> Vec<(u8, usize)> {
        self.store.zoom_inventory()
    }

    /// Drains worker results, refills the dispatch window, and re-checks
    /// session completion. Call on a short periodic tick; the engine never
    /// blocks or busy-spins here.
    pub fn pump(&mut self) {
        while let Ok(result) = self.result_rx.try_recv() {
            self.handle_result(result);
        }
        self.dispatch();
        self.check_completion(true);
    }

    /// Disconnects the worker and waits for it to drain in-flight requests
    pub fn shutdown(mut self) {
        self.task_tx = None;
        if let Some(worker) = self.worker.take() {
            worker.join();
        }
    }

    /// Single mutation point for every worker outcome
    fn handle_result(&mut self, result: FetchResult) {
        if result.generation != self.generation {
            debug!(
                "discarding stale result for {} (generation {} < {})",
                result.coord, result.generation, self.generation
            );
            return;
        }
        self.queued_keys.remove(&result.coord);

        if self.in_flight == 0 {
            warn!("in-flight counter underflow on {}", result.coord);
        } else {
            self.in_flight -= 1;
        }

        let is_region = result.kind == RequestKind::Region;
        if is_region {
            if let Some(session) = &mut self.session {
                if session.in_flight == 0 {
                    warn!("session in-flight counter underflow on {}", result.coord);
                } else {
                    session.in_flight -= 1;
                }
            }
        }

        match result.outcome {
            FetchOutcome::Fetched(bytes) | FetchOutcome::CacheHit(bytes) => {
                if is_region {
                    if let Some(session) = &mut self.session {
                        if session.completed < session.total {
                            session.completed += 1;
                        } else {
                            warn!("progress beyond expected total on {}", result.coord);
                        }
                    }
                }
                self.register_tile(result.coord, &bytes);
            }
            FetchOutcome::NotFound => {
                debug!("tile {} does not exist on the server", result.coord);
                if is_region {
                    if let Some(session) = &mut self.session {
                        session.failed += 1;
                    }
                }
            }
            FetchOutcome::Failed { reason, attempts } => {
                warn!(
                    "tile {} failed after {attempts} attempts: {reason}",
                    result.coord
                );
                if is_region {
                    if let Some(session) = &mut self.session {
                        session.failed += 1;
                    }
                }
            }
        }

        if is_region {
            if let Some(session) = &self.session {
                let _ = self.event_tx.send(EngineEvent::RegionProgress {
                    current: session.completed,
                    total: session.total,
                    zoom: result.coord.z,
                });
            }
            self.check_completion(false);
        }
    }

    /// Hands queued requests to the worker while under the concurrency cap
    fn dispatch(&mut self) {
        let Some(task_tx) = &self.task_tx else { return };
        while self.in_flight < self.config.max_concurrent {
            let Some(task) = self.pending.pop_front() else { break };
            let is_region = task.kind == RequestKind::Region;
            let coord = task.coord;
            if task_tx.send(task).is_err() {
                warn!("fetch worker gone, dropping queued requests");
                self.queued_keys.remove(&coord);
                self.pending.clear();
                self.queued_keys.clear();
                break;
            }
            self.in_flight += 1;
            if is_region {
                if let Some(session) = &mut self.session {
                    session.in_flight += 1;
                }
            }
        }
    }

    /// Emits `DownloadFinished` exactly once when every slot of the session
    /// has resolved. `periodic` marks calls from the pump tick, which feed
    /// the stall guard: a lost callback must not leave the session stuck
    /// forever, but completion is never forced while results are still owed.
    fn check_completion(&mut self, periodic: bool) {
        let region_queued = self
            .pending
            .iter()
            .any(|task| task.kind == RequestKind::Region);
        let Some(session) = &mut self.session else { return };
        if session.finished_emitted {
            return;
        }
        if session.resolved() < session.total || region_queued {
            session.stall_ticks = 0;
            return;
        }
        if session.in_flight == 0 {
            debug!(
                "region download finished: {}/{} ({} failed)",
                session.completed, session.total, session.failed
            );
            session.finished_emitted = true;
            let _ = self.event_tx.send(EngineEvent::DownloadFinished);
        } else if periodic {
            session.stall_ticks += 1;
            if session.stall_ticks > STALL_LIMIT {
                warn!(
                    "forcing region completion with {} phantom in-flight requests",
                    session.in_flight
                );
                self.in_flight = self.in_flight.saturating_sub(session.in_flight);
                session.in_flight = 0;
                session.finished_emitted = true;
                let _ = self.event_tx.send(EngineEvent::DownloadFinished);
            }
        }
    }

    /// Invalidate all region bookkeeping and queued work; results from
    /// earlier generations will be ignored on arrival
    fn abandon_session(&mut self) {
        self.generation += 1;
        self.pending.clear();
        self.queued_keys.clear();
        self.in_flight = 0;
        self.session = None;
    }

    fn enqueue(&mut self, coord: TileCoord, kind: RequestKind) {
        if !self.queued_keys.insert(coord) {
            return;
        }
        self.pending.push_back(FetchTask {
            coord,
            url: self.source.url(coord),
            dest: self.store.path_for(coord),
            generation: self.generation,
            kind,
        });
    }

    /// Queues loads for viewport tiles not yet displayed: cached tiles are
    /// read off the control thread by the worker, missing tiles are fetched
    /// when browse-download is enabled.
    fn load_visible_tiles(&mut self) {
        if !self.display_attached {
            return;
        }
        let window = self.viewport.window(0);
        for coord in window.iter() {
            if self.displayed.contains_key(&coord) || self.queued_keys.contains(&coord) {
                continue;
            }
            if self.store.exists(coord) || self.config.browse_download {
                self.enqueue(coord, RequestKind::Viewport);
            }
        }
        self.dispatch();
    }

    /// Synchronous cache-only load of the current window; returns the number
    /// of tiles in view that are available locally
    fn load_local_window(&mut self) -> usize {
        let window = self.viewport.window(0);
        let mut loaded = 0usize;
        for coord in window.iter() {
            if self.displayed.contains_key(&coord) {
                loaded += 1;
                continue;
            }
            if !self.store.exists(coord) {
                continue;
            }
            match self.store.load(coord) {
                Ok(bytes) => {
                    if self.display_attached {
                        self.register_tile(coord, &bytes);
                        if self.displayed.contains_key(&coord) {
                            loaded += 1;
                        }
                    } else {
                        loaded += 1;
                    }
                }
                Err(e) => debug!("skipping unreadable tile {coord}: {e}"),
            }
        }
        loaded
    }

    /// Decodes and registers a tile in the displayed table, positioned
    /// relative to the current center tile
    fn register_tile(&mut self, coord: TileCoord, bytes: &[u8]) {
        if !self.display_attached || coord.z != self.viewport.zoom {
            return;
        }
        let image = match self.images.get(&coord) {
            Some(image) => image,
            None => match image::load_from_memory(bytes) {
                Ok(decoded) => {
                    let image = Arc::new(decoded.to_rgba8());
                    self.images.put(coord, Arc::clone(&image));
                    image
                }
                Err(e) => {
                    warn!("failed to decode tile {coord}: {e}");
                    return;
                }
            },
        };
        let offset = self.viewport.placement(coord);
        self.displayed.insert(
            coord,
            DisplayedTile {
                coord,
                offset,
                image,
            },
        );
    }

    /// Evicts tiles whose zoom differs from the current one, or whose index
    /// lies outside the viewport window expanded by the cleanup margin
    fn cleanup_tiles(&mut self) {
        let window = self.viewport.window(self.config.cleanup_margin as i64);
        let zoom = self.viewport.zoom;
        let before = self.displayed.len();
        self.displayed
            .retain(|coord, _| coord.z == zoom && window.contains(*coord));
        let evicted = before - self.displayed.len();
        if evicted > 0 {
            debug!("evicted {evicted} tiles, {} retained", self.displayed.len());
        }
    }

    /// Recomputes every retained tile's offset against the current center
    fn reposition_tiles(&mut self) {
        let viewport = self.viewport.clone();
        for tile in self.displayed.values_mut() {
            tile.offset = viewport.placement(tile.coord);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::thread;
    use std::time::Instant;
    use tempfile::TempDir;

    const PNG_STUB: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];

    fn test_config(root: &Path, template: &str) -> EngineConfig {
        EngineConfig {
            url_template: template.to_string(),
            subdomains: Vec::new(),
            cache_dir: root.to_path_buf(),
            tile_size: 256,
            viewport_tiles_x: 5,
            viewport_tiles_y: 5,
            max_concurrent: 4,
            retry_max: 1,
            backoff_initial_ms: 10,
            cleanup_margin: 2,
            browse_download: false,
        }
    }

    /// Loopback URL with nothing listening; every connect is refused
    fn dead_template() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}/{{z}}/{{x}}/{{y}}.png")
    }

    fn fill_region(store: &TileStore, min_zoom: u8, max_zoom: u8) -> usize {
        let mut count = 0;
        for zoom in min_zoom..=max_zoom {
            let window = TileWindow::covering(18.0, 54.0, 73.0, 135.0, zoom);
            for coord in window.iter() {
                store.save(coord, PNG_STUB).unwrap();
                count += 1;
            }
        }
        count
    }

    fn drain(events: &Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[test]
    fn test_fully_cached_region_finishes_immediately() {
        let dir = TempDir::new().unwrap();
        let mut engine = TileEngine::new(test_config(dir.path(), &dead_template())).unwrap();
        let events = engine.events();

        let cached = fill_region(engine.store(), 1, 3);
        assert_eq!(cached, 9);

        engine.download_region(18.0, 54.0, 73.0, 135.0, 1, 3);

        let seen = drain(&events);
        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, EngineEvent::DownloadFinished))
                .count(),
            1
        );
        assert_eq!(engine.region_progress(), Some((9, 9)));
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.pending_len(), 0);
        engine.shutdown();
    }

    #[test]
    fn test_finished_not_reemitted_by_later_pumps() {
        let dir = TempDir::new().unwrap();
        let mut engine = TileEngine::new(test_config(dir.path(), &dead_template())).unwrap();
        let events = engine.events();

        fill_region(engine.store(), 1, 2);
        engine.download_region(18.0, 54.0, 73.0, 135.0, 1, 2);
        drain(&events);

        for _ in 0..10 {
            engine.pump();
        }
        assert!(drain(&events).is_empty());
        engine.shutdown();
    }

    #[test]
    fn test_unreachable_server_resolves_session_via_failures() {
        let dir = TempDir::new().unwrap();
        let mut engine = TileEngine::new(test_config(dir.path(), &dead_template())).unwrap();
        let events = engine.events();

        engine.download_region(18.0, 54.0, 73.0, 135.0, 1, 2);
        assert_eq!(engine.region_progress(), Some((0, 3)));

        let deadline = Instant::now() + Duration::from_secs(20);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            engine.pump();
            seen.extend(drain(&events));
            if seen.iter().any(|e| matches!(e, EngineEvent::DownloadFinished)) {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, EngineEvent::DownloadFinished))
                .count(),
            1
        );
        // failures resolve the slots but contribute no progress
        assert_eq!(engine.region_progress(), Some((0, 3)));
        engine.shutdown();
    }

    #[test]
    fn test_zoom_change_abandons_stale_session() {
        let dir = TempDir::new().unwrap();
        let mut engine = TileEngine::new(test_config(dir.path(), &dead_template())).unwrap();
        let events = engine.events();

        engine.download_region(18.0, 54.0, 73.0, 135.0, 1, 3);
        engine.set_zoom(5);
        assert_eq!(engine.region_progress(), None);
        assert_eq!(engine.pending_len(), 0);

        // stale results must neither fire DownloadFinished nor corrupt
        // counters of a later session
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            engine.pump();
            assert!(!drain(&events)
                .iter()
                .any(|e| matches!(e, EngineEvent::DownloadFinished)));
            thread::sleep(Duration::from_millis(10));
        }

        fill_region(engine.store(), 1, 1);
        engine.download_region(18.0, 54.0, 73.0, 135.0, 1, 1);
        let seen = drain(&events);
        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, EngineEvent::DownloadFinished))
                .count(),
            1
        );
        engine.shutdown();
    }

    #[test]
    fn test_check_local_tiles_empty_cache() {
        let dir = TempDir::new().unwrap();
        let mut engine = TileEngine::new(test_config(dir.path(), &dead_template())).unwrap();
        let events = engine.events();

        engine.check_local_tiles();
        assert_eq!(drain(&events), vec![EngineEvent::NoLocalTilesFound]);
        engine.shutdown();
    }

    #[test]
    fn test_check_local_tiles_picks_highest_zoom() {
        let dir = TempDir::new().unwrap();
        let mut engine = TileEngine::new(test_config(dir.path(), &dead_template())).unwrap();
        let events = engine.events();

        // populate zoom 3 fully around the default center plus a lone tile
        // at zoom 2
        engine.store().save(TileCoord::new(0, 0, 2), PNG_STUB).unwrap();
        let window = Viewport::new(engine.center(), 3, 256, 5, 5).window(0);
        for coord in window.iter() {
            engine.store().save(coord, PNG_STUB).unwrap();
        }

        engine.check_local_tiles();
        let seen = drain(&events);
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            EngineEvent::LocalTilesFound { zoom, count } => {
                assert_eq!(*zoom, 3);
                assert_eq!(*count, window.count());
            }
            other => panic!("expected LocalTilesFound, got {other:?}"),
        }
        assert_eq!(engine.zoom(), 3);
        engine.shutdown();
    }

    #[test]
    fn test_max_available_zoom_passthrough() {
        let dir = TempDir::new().unwrap();
        let engine = TileEngine::new(test_config(dir.path(), &dead_template())).unwrap();
        assert_eq!(engine.max_available_zoom(), 0);
        engine.store().save(TileCoord::new(1, 1, 7), PNG_STUB).unwrap();
        assert_eq!(engine.max_available_zoom(), 7);
        engine.shutdown();
    }
}

//! Fetch worker: the engine's I/O domain
//!
//! Runs on a dedicated thread with its own tokio runtime so that network
//! and disk I/O never stall the orchestrator. Each request resolves to
//! exactly one terminal [`FetchOutcome`], delivered back over the result
//! channel; errors never cross the boundary as panics or `Err` values.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, error, warn};
use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use tokio::sync::Semaphore;

use crate::core::geo::TileCoord;
use crate::fetch::retry::RetryPolicy;
use crate::store::disk;

/// Shared async HTTP client for tile fetching. Tile servers may reject
/// bare/default clients, so the headers mimic a browser.
static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("image/png,image/svg+xml,image/*;q=0.8,*/*;q=0.5"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    reqwest::Client::builder()
        .user_agent(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        )
        .default_headers(headers)
        .timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(16)
        .build()
        .expect("failed to build reqwest async client")
});

/// Why a tile was requested; region results feed the session counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Viewport,
    Region,
}

/// One unit of work handed to the worker
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub coord: TileCoord,
    pub url: String,
    pub dest: PathBuf,
    pub generation: u64,
    pub kind: RequestKind,
}

/// Terminal outcome of a fetch task
#[derive(Debug)]
pub enum FetchOutcome {
    /// Downloaded, validated, and persisted
    Fetched(Vec<u8>),
    /// Satisfied from the existing on-disk file without a network call
    CacheHit(Vec<u8>),
    /// The server does not have this tile; permanent, never retried
    NotFound,
    /// Transient failures exhausted the retry budget
    Failed { reason: String, attempts: u32 },
}

#[derive(Debug)]
pub struct FetchResult {
    pub coord: TileCoord,
    pub generation: u64,
    pub kind: RequestKind,
    pub outcome: FetchOutcome,
}

/// Outcome of a single network attempt
enum Attempt {
    Fetched(Vec<u8>),
    NotFound,
    Transient(String),
}

/// Handle to the worker thread. Dropping the task sender shuts the worker
/// down once in-flight requests have drained.
pub struct FetchWorker {
    handle: Option<thread::JoinHandle<()>>,
}

impl FetchWorker {
    pub fn start(
        policy: RetryPolicy,
        max_concurrent: usize,
        task_rx: Receiver<FetchTask>,
        result_tx: Sender<FetchResult>,
    ) -> Self {
        let handle = thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("tile-fetch")
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("failed to start fetch runtime: {e}");
                    return;
                }
            };
            runtime.block_on(run_loop(policy, max_concurrent, task_rx, result_tx));
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Waits for the worker thread to exit. The task channel must already
    /// be disconnected or this blocks until it is.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("fetch worker thread panicked");
            }
        }
    }
}

async fn run_loop(
    policy: RetryPolicy,
    max_concurrent: usize,
    task_rx: Receiver<FetchTask>,
    result_tx: Sender<FetchResult>,
) {
    debug!("fetch worker starting, concurrency cap {max_concurrent}");
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let outstanding = Arc::new(AtomicUsize::new(0));

    loop {
        match task_rx.try_recv() {
            Ok(task) => {
                let semaphore = Arc::clone(&semaphore);
                let result_tx = result_tx.clone();
                let outstanding = Arc::clone(&outstanding);
                outstanding.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let result = run_task(task, policy, semaphore).await;
                    let _ = result_tx.send(result);
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Err(TryRecvError::Empty) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(TryRecvError::Disconnected) => break,
        }
    }

    // drain in-flight requests before the runtime is torn down; each is
    // bounded by the request timeout
    while outstanding.load(Ordering::SeqCst) > 0 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    debug!("fetch worker exiting");
}

async fn run_task(task: FetchTask, policy: RetryPolicy, semaphore: Arc<Semaphore>) -> FetchResult {
    // an existing file satisfies the request without touching the network
    if task.dest.is_file() {
        match disk::read_tile(&task.dest) {
            Ok(bytes) => return resolve(task, FetchOutcome::CacheHit(bytes)),
            Err(e) => debug!("cached tile {} unreadable, refetching: {e}", task.coord),
        }
    }

    let mut attempts = 0u32;
    loop {
        // the concurrency slot is held only for the attempt itself, not
        // across backoff sleeps
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return resolve(
                    task,
                    FetchOutcome::Failed {
                        reason: "worker shutting down".to_string(),
                        attempts,
                    },
                );
            }
        };
        let outcome = perform_attempt(&task).await;
        drop(permit);
        attempts += 1;

        match outcome {
            Attempt::Fetched(bytes) => return resolve(task, FetchOutcome::Fetched(bytes)),
            Attempt::NotFound => {
                debug!("tile {} not found on server", task.coord);
                return resolve(task, FetchOutcome::NotFound);
            }
            Attempt::Transient(reason) => {
                if policy.is_exhausted(attempts) {
                    warn!("tile {} failed after {attempts} attempts: {reason}", task.coord);
                    return resolve(task, FetchOutcome::Failed { reason, attempts });
                }
                let delay = policy.backoff_for(attempts - 1);
                debug!(
                    "tile {} attempt {attempts} failed ({reason}), retrying in {delay:?}",
                    task.coord
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn perform_attempt(task: &FetchTask) -> Attempt {
    let response = match HTTP_CLIENT.get(&task.url).send().await {
        Ok(response) => response,
        Err(e) => return Attempt::Transient(format!("request error: {e}")),
    };

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Attempt::NotFound;
    }
    if !status.is_success() {
        return Attempt::Transient(format!("HTTP {status}"));
    }

    let bytes = match response.bytes().await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => return Attempt::Transient(format!("read error: {e}")),
    };
    if bytes.is_empty() {
        return Attempt::Transient("empty response body".to_string());
    }
    if !has_image_signature(&bytes) {
        return Attempt::Transient("payload is not a recognized image".to_string());
    }

    // only a confirmed on-disk copy counts as success
    if let Err(e) = disk::write_tile(&task.dest, &bytes) {
        return Attempt::Transient(format!("persist failed: {e}"));
    }
    Attempt::Fetched(bytes)
}

fn resolve(task: FetchTask, outcome: FetchOutcome) -> FetchResult {
    FetchResult {
        coord: task.coord,
        generation: task.generation,
        kind: task.kind,
        outcome,
    }
}

/// Recognized raster magic bytes: PNG and JPEG
pub(crate) fn has_image_signature(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) || bytes.starts_with(&[0xFF, 0xD8, 0xFF])
}

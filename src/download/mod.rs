//! Image downloads with one transfer per URL at a time.
//!
//! The manager keeps an in-flight registry keyed by source URL. A second
//! request for a URL that is still downloading is rejected with
//! [`Error::AlreadyInFlight`]; the first caller's result reaches everyone else
//! through the store. Cancelling a URL flips the transfer's flag, which the
//! fetcher checks between chunks.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::DownloadConfig;
use crate::error::{Error, Result};

/// Trait for transports that can fetch the raw bytes behind a URL.
pub trait ImageFetcher: Send + Sync {
    /// Fetch `url`, giving up with [`Error::Cancelled`] once `cancel` is set.
    fn get(&self, url: &str, cancel: &AtomicBool) -> Result<Vec<u8>>;
}

/// Plain HTTP GET via ureq, read in chunks so cancellation takes effect
/// mid-transfer.
pub struct HttpFetcher {
    agent: ureq::Agent,
    chunk_size: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, chunk_size: usize) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn from_config(config: &DownloadConfig) -> Self {
        Self::new(Duration::from_secs(config.timeout_secs), config.chunk_size)
    }
}

impl ImageFetcher for HttpFetcher {
    fn get(&self, url: &str, cancel: &AtomicBool) -> Result<Vec<u8>> {
        let response = self.agent.get(url).call()?;
        let mut reader = response.into_reader();
        let mut chunk = vec![0u8; self.chunk_size];
        let mut bytes = Vec::new();

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            let n = reader
                .read(&mut chunk)
                .map_err(|e| Error::Network(format!("Failed to read image body: {}", e)))?;
            if n == 0 {
                break;
            }
            bytes.extend_from_slice(&chunk[..n]);
        }

        Ok(bytes)
    }
}

/// Identifies one transfer. A URL that is cancelled and requested again gets
/// a new id, so late completions of the old transfer can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(u64);

/// Outcome handed to the [`DownloadManager::spawn_fetch`] callback.
#[derive(Debug)]
pub struct DownloadFinished {
    pub url: String,
    pub transfer: TransferId,
    pub result: Result<Vec<u8>>,
}

#[derive(Clone)]
struct Transfer {
    id: TransferId,
    cancel: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct DownloadManager {
    fetcher: Arc<dyn ImageFetcher>,
    in_flight: Arc<Mutex<HashMap<String, Transfer>>>,
    next_id: Arc<AtomicU64>,
}

impl DownloadManager {
    pub fn new(fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self {
            fetcher,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn from_config(config: &DownloadConfig) -> Self {
        Self::new(Arc::new(HttpFetcher::from_config(config)))
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Transfer>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `url` for a new transfer. `None` when one is already running.
    fn register(&self, url: &str) -> Option<Transfer> {
        let mut registry = self.registry();
        if registry.contains_key(url) {
            tracing::debug!(url, "Download already in flight, rejecting duplicate");
            return None;
        }
        let transfer = Transfer {
            id: TransferId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            cancel: Arc::new(AtomicBool::new(false)),
        };
        registry.insert(url.to_string(), transfer.clone());
        Some(transfer)
    }

    fn run(&self, url: &str, transfer: &Transfer) -> Result<Vec<u8>> {
        let result = self.fetcher.get(url, &transfer.cancel);

        {
            // Only drop our own entry; a cancel may have let a newer fetch in
            let mut registry = self.registry();
            if registry.get(url).is_some_and(|t| t.id == transfer.id) {
                registry.remove(url);
            }
        }

        if transfer.cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        result
    }

    /// Download `url` on the calling thread.
    pub fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let transfer = self
            .register(url)
            .ok_or_else(|| Error::AlreadyInFlight(url.to_string()))?;
        self.run(url, &transfer)
    }

    /// Download `url` on a background thread and hand the outcome to
    /// `on_done` there. Returns `None` without starting anything if `url` is
    /// already in flight.
    pub fn spawn_fetch<F>(&self, url: &str, on_done: F) -> Option<TransferId>
    where
        F: FnOnce(DownloadFinished) + Send + 'static,
    {
        let transfer = self.register(url)?;
        let id = transfer.id;

        let manager = self.clone();
        let url = url.to_string();
        std::thread::spawn(move || {
            let result = manager.run(&url, &transfer);
            on_done(DownloadFinished {
                url,
                transfer: transfer.id,
                result,
            });
        });
        Some(id)
    }

    /// The transfer currently registered for `url`, if any.
    pub fn current_transfer(&self, url: &str) -> Option<TransferId> {
        self.registry().get(url).map(|t| t.id)
    }

    /// Abort the transfer for `url`, if any. Returns true if one was running.
    pub fn cancel(&self, url: &str) -> bool {
        match self.registry().remove(url) {
            Some(transfer) => {
                transfer.cancel.store(true, Ordering::SeqCst);
                tracing::debug!(url, "Download cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self, url: &str) -> bool {
        self.registry().contains_key(url)
    }

    pub fn in_flight_count(&self) -> usize {
        self.registry().len()
    }
}

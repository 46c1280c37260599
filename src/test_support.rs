//! Substitutable fakes for the network seams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex};
use std::time::Duration;

use crate::download::ImageFetcher;
use crate::error::{Error, Result};
use crate::search::{PhotoSearch, SearchHit, SearchResultPage};

pub struct FakeFetcher {
    body: Vec<u8>,
    echo_url: bool,
    fail_status: Option<u16>,
    gated: bool,
    calls: AtomicUsize,
    started_tx: Mutex<mpsc::Sender<()>>,
    started_rx: Mutex<mpsc::Receiver<()>>,
    release_tx: Mutex<mpsc::Sender<()>>,
    release_rx: Mutex<mpsc::Receiver<()>>,
}

impl FakeFetcher {
    pub fn new(body: Vec<u8>) -> Self {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        Self {
            body,
            echo_url: false,
            fail_status: None,
            gated: false,
            calls: AtomicUsize::new(0),
            started_tx: Mutex::new(started_tx),
            started_rx: Mutex::new(started_rx),
            release_tx: Mutex::new(release_tx),
            release_rx: Mutex::new(release_rx),
        }
    }

    /// Responds with the URL's own bytes.
    pub fn echo() -> Self {
        Self {
            echo_url: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn failing(status: u16) -> Self {
        Self {
            fail_status: Some(status),
            ..Self::new(Vec::new())
        }
    }

    /// Blocks every transfer until [`FakeFetcher::release`] or cancellation.
    pub fn gated(body: Vec<u8>) -> Self {
        Self {
            gated: true,
            ..Self::new(body)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn wait_started(&self) {
        self.started_rx
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(5))
            .expect("transfer never started");
    }

    pub fn release(&self) {
        self.release_tx.lock().unwrap().send(()).unwrap();
    }
}

impl ImageFetcher for FakeFetcher {
    fn get(&self, url: &str, cancel: &AtomicBool) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.started_tx.lock().unwrap().send(());

        if self.gated {
            loop {
                if cancel.load(Ordering::SeqCst) {
                    return Err(Error::Cancelled);
                }
                let released = self
                    .release_rx
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_millis(5));
                match released {
                    Ok(()) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        return Err(Error::Network("gate closed".to_string()))
                    }
                }
            }
        }

        if let Some(status) = self.fail_status {
            return Err(Error::Server(status));
        }
        if self.echo_url {
            return Ok(url.as_bytes().to_vec());
        }
        Ok(self.body.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchCall {
    pub latitude: f64,
    pub longitude: f64,
    pub known_total_pages: Option<u32>,
}

#[derive(Default)]
pub struct FakeSearch {
    responses: Mutex<VecDeque<Result<SearchResultPage>>>,
    calls: Mutex<Vec<SearchCall>>,
}

impl FakeSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: Result<SearchResultPage>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> Vec<SearchCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Block until `n` searches have been made.
    pub fn wait_for_calls(&self, n: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while self.calls.lock().unwrap().len() < n {
            assert!(std::time::Instant::now() < deadline, "search never called");
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

impl PhotoSearch for FakeSearch {
    fn search(
        &self,
        latitude: f64,
        longitude: f64,
        known_total_pages: Option<u32>,
    ) -> Result<SearchResultPage> {
        // Take the response before recording the call, so a test that sees the
        // call knows which response it got
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SearchResultPage::default()));
        self.calls.lock().unwrap().push(SearchCall {
            latitude,
            longitude,
            known_total_pages,
        });
        response
    }
}

/// Build a result page from `(title, url)` pairs.
pub fn page(total_pages: u32, hits: &[(&str, Option<&str>)]) -> SearchResultPage {
    SearchResultPage {
        total_pages,
        photos: hits
            .iter()
            .map(|(title, url)| SearchHit {
                title: title.to_string(),
                url: url.map(|u| u.to_string()),
            })
            .collect(),
    }
}

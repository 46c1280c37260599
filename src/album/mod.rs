//! Per-pin photo album orchestration.
//!
//! The coordinator decides when to search, turns search hits into stored
//! photos, and feeds image bytes from the download manager back into the
//! store. It is the policy boundary for errors: cancellations are silent, an
//! empty search is a status rather than a failure, and everything else
//! becomes a user-facing message, with at most one alert outstanding.
//!
//! Two ways to drive it:
//! - blocking calls ([`AlbumCoordinator::ensure_loaded`],
//!   [`AlbumCoordinator::image_for`], ...) that run the network request on
//!   the calling thread and return the result directly;
//! - background calls ([`AlbumCoordinator::begin_load`],
//!   [`AlbumCoordinator::request_image`]) that run the request on a worker
//!   thread. Their results are applied to the store only when the owner calls
//!   [`AlbumCoordinator::poll`], so all mutations stay on the owner thread.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::{Photo, Pin, Store};
use crate::download::{DownloadFinished, DownloadManager, TransferId};
use crate::error::{Error, Result};
use crate::search::{PhotoSearch, SearchHit, SearchResultPage};

pub const NO_PHOTOS_MESSAGE: &str = "No photos available in this location";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlbumState {
    Empty,
    Loading,
    Loaded { photos: usize },
}

/// Outcome of a successful load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlbumStatus {
    Ready(usize),
    NoPhotos,
}

impl AlbumStatus {
    /// Informational text for the album, if any.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            AlbumStatus::Ready(_) => None,
            AlbumStatus::NoPhotos => Some(NO_PHOTOS_MESSAGE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadRequest {
    AlreadyLoaded(usize),
    AlreadyLoading,
    Started,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageLookup {
    Cached(Vec<u8>),
    Pending,
}

/// Results of background work, returned by [`AlbumCoordinator::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlbumNotice {
    Loaded { pin_id: i64, photos: usize },
    NoPhotos { pin_id: i64 },
    ImageReady { photo_id: i64, bytes: Vec<u8> },
    Alert { message: String },
}

enum Completion {
    Search {
        pin: Pin,
        token: u64,
        result: Result<SearchResultPage>,
    },
    Download(DownloadFinished),
}

/// Photos waiting on the background transfer for one URL.
struct Waiters {
    transfer: TransferId,
    photos: Vec<Photo>,
}

pub struct AlbumCoordinator {
    store: Arc<Store>,
    search: Arc<dyn PhotoSearch>,
    downloads: DownloadManager,
    states: HashMap<i64, AlbumState>,
    /// Page count from the last search per pin, for random page selection.
    total_pages: HashMap<i64, u32>,
    /// Token of the background load each pin is waiting for. Results carrying
    /// any other token are stale.
    loads: HashMap<i64, u64>,
    next_load: u64,
    /// Photos waiting for a background download, by source URL.
    waiting: HashMap<String, Waiters>,
    alert_showing: bool,
    tx: mpsc::Sender<Completion>,
    rx: mpsc::Receiver<Completion>,
}

impl AlbumCoordinator {
    pub fn new(store: Arc<Store>, search: Arc<dyn PhotoSearch>, downloads: DownloadManager) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            store,
            search,
            downloads,
            states: HashMap::new(),
            total_pages: HashMap::new(),
            loads: HashMap::new(),
            next_load: 0,
            waiting: HashMap::new(),
            alert_showing: false,
            tx,
            rx,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn state(&self, pin: &Pin) -> AlbumState {
        self.states.get(&pin.id).copied().unwrap_or(AlbumState::Empty)
    }

    pub fn known_total_pages(&self, pin: &Pin) -> Option<u32> {
        self.total_pages.get(&pin.id).copied()
    }

    pub fn is_alert_showing(&self) -> bool {
        self.alert_showing
    }

    /// The user dismissed the current alert; the next failure may show again.
    pub fn acknowledge_alert(&mut self) {
        self.alert_showing = false;
    }

    /// Number of source URLs with photos waiting on a background download.
    pub fn pending_image_count(&self) -> usize {
        self.waiting.len()
    }

    // ========================================================================
    // Loading the album
    // ========================================================================

    /// Search for photos unless the pin already has some.
    pub fn ensure_loaded(&mut self, pin: &Pin) -> Result<AlbumStatus> {
        self.supersede_load(pin.id);
        let count = self.store.photo_count(pin)?;
        if count > 0 {
            self.states.insert(pin.id, AlbumState::Loaded { photos: count });
            return Ok(AlbumStatus::Ready(count));
        }
        self.load(pin)
    }

    /// Replace the pin's photos with a fresh (randomly paged) search.
    pub fn request_new_collection(&mut self, pin: &Pin) -> Result<AlbumStatus> {
        self.supersede_load(pin.id);
        self.clear_photos(pin)?;
        self.load(pin)
    }

    fn load(&mut self, pin: &Pin) -> Result<AlbumStatus> {
        let (latitude, longitude) = pin.coordinate()?;
        if self.store.get_pin(pin.id)?.is_none() {
            self.forget_pin(pin.id);
            return Err(Error::NotFound(format!("pin {}", pin.id)));
        }
        self.states.insert(pin.id, AlbumState::Loading);
        let result = self
            .search
            .search(latitude, longitude, self.known_total_pages(pin));
        self.apply_search(pin, result)
    }

    fn apply_search(&mut self, pin: &Pin, result: Result<SearchResultPage>) -> Result<AlbumStatus> {
        let outcome = match result {
            Ok(page) => {
                self.total_pages.insert(pin.id, page.total_pages);
                self.store_hits(pin, page.photos)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(stored) => {
                self.states.insert(pin.id, AlbumState::Loaded { photos: stored });
                tracing::info!(pin_id = pin.id, photos = stored, "Album loaded");
                if stored == 0 {
                    Ok(AlbumStatus::NoPhotos)
                } else {
                    Ok(AlbumStatus::Ready(stored))
                }
            }
            Err(e) => {
                self.states.insert(pin.id, AlbumState::Loaded { photos: 0 });
                tracing::warn!(pin_id = pin.id, error = %e, "Album load failed");
                Err(e)
            }
        }
    }

    /// Persist hits that carry a URL, committed as one batch. Nothing is kept
    /// if any part of the batch fails.
    fn store_hits(&self, pin: &Pin, hits: Vec<SearchHit>) -> Result<usize> {
        let result = self
            .stage_hits(pin, hits)
            .and_then(|stored| self.store.save().map(|_| stored));
        if result.is_err() {
            if let Err(e) = self.store.rollback() {
                tracing::error!(pin_id = pin.id, error = %e, "Failed to discard partial photo batch");
            }
        }
        result
    }

    fn stage_hits(&self, pin: &Pin, hits: Vec<SearchHit>) -> Result<usize> {
        let mut stored = 0;
        for hit in hits {
            match hit.url {
                Some(url) => {
                    self.store.create_photo(&hit.title, &url, pin)?;
                    stored += 1;
                }
                None => tracing::debug!(title = %hit.title, "Dropping search hit without url"),
            }
        }
        Ok(stored)
    }

    /// Forget any background load still pending for the pin.
    fn supersede_load(&mut self, pin_id: i64) {
        if self.loads.remove(&pin_id).is_some() {
            tracing::debug!(pin_id, "Superseding background load");
            self.states.remove(&pin_id);
        }
    }

    fn forget_pin(&mut self, pin_id: i64) {
        self.states.remove(&pin_id);
        self.total_pages.remove(&pin_id);
        self.loads.remove(&pin_id);
    }

    /// Cancel downloads for the pin's photos and delete them in one commit.
    fn clear_photos(&mut self, pin: &Pin) -> Result<usize> {
        for photo in self.store.list_photos(pin)? {
            self.forget_download(&photo);
        }
        let deleted = self.store.delete_photos_for_pin(pin)?;
        self.store.save()?;
        self.states.insert(pin.id, AlbumState::Loaded { photos: 0 });
        Ok(deleted)
    }

    // ========================================================================
    // Images
    // ========================================================================

    fn cached_image(&self, photo: &Photo) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = &photo.image {
            return Ok(Some(bytes.clone()));
        }
        // The caller's copy may predate a download that has since been saved
        Ok(self.store.get_photo(photo.id)?.and_then(|p| p.image))
    }

    /// Return the photo's bytes, downloading and caching them if needed.
    pub fn image_for(&mut self, photo: &Photo) -> Result<Vec<u8>> {
        if let Some(bytes) = self.cached_image(photo)? {
            return Ok(bytes);
        }

        let bytes = self.downloads.fetch(&photo.source_url)?;
        self.store.update_photo_image(photo, &bytes)?;
        self.store.save()?;
        Ok(bytes)
    }

    /// Cached bytes right away, or start a background download whose result
    /// arrives through [`AlbumCoordinator::poll`].
    pub fn request_image(&mut self, photo: &Photo) -> Result<ImageLookup> {
        if let Some(bytes) = self.cached_image(photo)? {
            return Ok(ImageLookup::Cached(bytes));
        }

        let url = &photo.source_url;
        if let Some(waiters) = self.waiting.get_mut(url) {
            if !waiters.photos.iter().any(|p| p.id == photo.id) {
                waiters.photos.push(photo.clone());
            }
            tracing::debug!(url = %url, photo_id = photo.id, "Joining download already in flight");
            return Ok(ImageLookup::Pending);
        }

        let tx = self.tx.clone();
        // Rejected only when someone outside this coordinator holds the URL
        let transfer = self
            .downloads
            .spawn_fetch(url, move |done| {
                let _ = tx.send(Completion::Download(done));
            })
            .ok_or_else(|| Error::AlreadyInFlight(url.clone()))?;
        self.waiting.insert(
            url.clone(),
            Waiters {
                transfer,
                photos: vec![photo.clone()],
            },
        );
        Ok(ImageLookup::Pending)
    }

    /// The photo went out of view. Cancels the transfer once nobody else is
    /// waiting on the same URL.
    pub fn cancel_image_for(&mut self, photo: &Photo) -> bool {
        let url = &photo.source_url;
        if let Some(waiters) = self.waiting.get_mut(url) {
            waiters.photos.retain(|p| p.id != photo.id);
            if !waiters.photos.is_empty() {
                return false;
            }
            self.waiting.remove(url);
        }
        self.downloads.cancel(url)
    }

    fn forget_download(&mut self, photo: &Photo) {
        if let Some(waiters) = self.waiting.get_mut(&photo.source_url) {
            waiters.photos.retain(|p| p.id != photo.id);
            if waiters.photos.is_empty() {
                self.waiting.remove(&photo.source_url);
                self.downloads.cancel(&photo.source_url);
            }
        } else {
            self.downloads.cancel(&photo.source_url);
        }
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    pub fn delete_photo(&mut self, photo: &Photo) -> Result<()> {
        self.forget_download(photo);
        self.store.delete_photo(photo)?;
        self.store.save()?;
        if let Some(AlbumState::Loaded { photos }) = self.states.get_mut(&photo.pin_id) {
            *photos = photos.saturating_sub(1);
        }
        Ok(())
    }

    pub fn delete_all_photos(&mut self, pin: &Pin) -> Result<usize> {
        self.clear_photos(pin)
    }

    /// Delete the pin and everything the coordinator tracks for it.
    pub fn delete_pin(&mut self, pin: &Pin) -> Result<()> {
        for photo in self.store.list_photos(pin)? {
            self.forget_download(&photo);
        }
        self.store.delete_pin(pin)?;
        self.forget_pin(pin.id);
        Ok(())
    }

    // ========================================================================
    // Background work
    // ========================================================================

    /// Start loading the album on a worker thread. With `force` the current
    /// photos are replaced, as with [`AlbumCoordinator::request_new_collection`].
    pub fn begin_load(&mut self, pin: &Pin, force: bool) -> Result<LoadRequest> {
        if self.state(pin) == AlbumState::Loading {
            return Ok(LoadRequest::AlreadyLoading);
        }

        if force {
            self.clear_photos(pin)?;
        } else {
            let count = self.store.photo_count(pin)?;
            if count > 0 {
                self.states.insert(pin.id, AlbumState::Loaded { photos: count });
                return Ok(LoadRequest::AlreadyLoaded(count));
            }
        }

        let (latitude, longitude) = pin.coordinate()?;
        let known_total_pages = self.known_total_pages(pin);
        self.states.insert(pin.id, AlbumState::Loading);
        self.next_load += 1;
        let token = self.next_load;
        self.loads.insert(pin.id, token);

        let search = Arc::clone(&self.search);
        let tx = self.tx.clone();
        let pin = pin.clone();
        std::thread::spawn(move || {
            let result = search.search(latitude, longitude, known_total_pages);
            let _ = tx.send(Completion::Search { pin, token, result });
        });

        Ok(LoadRequest::Started)
    }

    /// Apply finished background work to the store. Call from the owner thread.
    pub fn poll(&mut self) -> Vec<AlbumNotice> {
        let mut notices = Vec::new();
        while let Ok(completion) = self.rx.try_recv() {
            self.apply_completion(completion, &mut notices);
        }
        notices
    }

    /// Block until at least one piece of background work finishes or
    /// `timeout` passes, then apply everything that is ready.
    pub fn wait_for_notices(&mut self, timeout: Duration) -> Vec<AlbumNotice> {
        let deadline = Instant::now() + timeout;
        let mut notices = Vec::new();

        while notices.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(completion) => self.apply_completion(completion, &mut notices),
                Err(_) => break,
            }
        }

        notices.extend(self.poll());
        notices
    }

    fn apply_completion(&mut self, completion: Completion, notices: &mut Vec<AlbumNotice>) {
        match completion {
            Completion::Search { pin, token, result } => {
                if self.loads.get(&pin.id) != Some(&token) {
                    tracing::debug!(pin_id = pin.id, "Dropping superseded search result");
                    return;
                }
                self.loads.remove(&pin.id);
                self.finish_search(pin, result, notices);
            }
            Completion::Download(done) => self.finish_download(done, notices),
        }
    }

    fn finish_search(&mut self, pin: Pin, result: Result<SearchResultPage>, notices: &mut Vec<AlbumNotice>) {
        match self.store.get_pin(pin.id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::debug!(pin_id = pin.id, "Pin deleted before its search finished");
                self.forget_pin(pin.id);
                return;
            }
            Err(e) => {
                self.states.insert(pin.id, AlbumState::Loaded { photos: 0 });
                notices.extend(self.alert(e.to_string()));
                return;
            }
        }

        match self.apply_search(&pin, result) {
            Ok(AlbumStatus::Ready(photos)) => notices.push(AlbumNotice::Loaded {
                pin_id: pin.id,
                photos,
            }),
            Ok(AlbumStatus::NoPhotos) => notices.push(AlbumNotice::NoPhotos { pin_id: pin.id }),
            Err(e) => notices.extend(self.alert(e.to_string())),
        }
    }

    fn finish_download(&mut self, done: DownloadFinished, notices: &mut Vec<AlbumNotice>) {
        let current = self
            .waiting
            .get(&done.url)
            .is_some_and(|w| w.transfer == done.transfer);
        if !current {
            // An earlier transfer of a URL that was cancelled and requested again
            tracing::debug!(url = %done.url, "Ignoring completion of a superseded transfer");
            return;
        }
        let waiters = self
            .waiting
            .remove(&done.url)
            .map(|w| w.photos)
            .unwrap_or_default();

        let bytes = match done.result {
            Ok(bytes) => bytes,
            Err(e) if e.is_silent() => {
                tracing::debug!(url = %done.url, error = %e, "Download ended quietly");
                return;
            }
            Err(e) => {
                tracing::warn!(url = %done.url, error = %e, "Download failed");
                notices.extend(self.alert(format!("Error while fetching photo for URL: {}", done.url)));
                return;
            }
        };

        if waiters.is_empty() {
            return;
        }

        let stored = waiters
            .iter()
            .try_for_each(|photo| self.store.update_photo_image(photo, &bytes))
            .and_then(|_| self.store.save());
        if let Err(e) = stored {
            tracing::error!(url = %done.url, error = %e, "Failed to cache downloaded image");
            notices.extend(self.alert(e.to_string()));
        }

        // Bytes are handed out even when caching failed; the next save may catch up
        for photo in waiters {
            notices.push(AlbumNotice::ImageReady {
                photo_id: photo.id,
                bytes: bytes.clone(),
            });
        }
    }

    fn alert(&mut self, message: String) -> Option<AlbumNotice> {
        if self.alert_showing {
            tracing::warn!(%message, "Alert suppressed while another is showing");
            return None;
        }
        self.alert_showing = true;
        Some(AlbumNotice::Alert { message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{page, FakeFetcher, FakeSearch};
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        _dir: TempDir,
        store: Arc<Store>,
        search: Arc<FakeSearch>,
        fetcher: Arc<FakeFetcher>,
        coordinator: AlbumCoordinator,
    }

    fn harness(fetcher: FakeFetcher) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("album.db")).unwrap());
        store.initialize().unwrap();
        let search = Arc::new(FakeSearch::new());
        let fetcher = Arc::new(fetcher);
        let coordinator = AlbumCoordinator::new(
            Arc::clone(&store),
            search.clone(),
            DownloadManager::new(fetcher.clone()),
        );
        Harness {
            _dir: dir,
            store,
            search,
            fetcher,
            coordinator,
        }
    }

    /// Wait until every background download has been applied.
    fn drain_images(coordinator: &mut AlbumCoordinator) -> Vec<AlbumNotice> {
        let mut notices = Vec::new();
        let deadline = Instant::now() + WAIT;
        while coordinator.pending_image_count() > 0 && Instant::now() < deadline {
            notices.extend(coordinator.wait_for_notices(Duration::from_millis(100)));
        }
        notices
    }

    #[test]
    fn test_ensure_loaded_stores_hits_with_urls() {
        let mut h = harness(FakeFetcher::new(vec![]));
        let pin = h.store.create_pin("37.7749", "-122.4194").unwrap();
        h.search.push(Ok(page(
            42,
            &[
                ("Bridge", Some("http://img/1.jpg")),
                ("No url", None),
                ("Bay", Some("http://img/2.jpg")),
            ],
        )));

        let status = h.coordinator.ensure_loaded(&pin).unwrap();
        assert_eq!(status, AlbumStatus::Ready(2));
        assert_eq!(h.coordinator.state(&pin), AlbumState::Loaded { photos: 2 });
        assert_eq!(h.coordinator.known_total_pages(&pin), Some(42));

        let photos = h.store.list_photos(&pin).unwrap();
        let titles: Vec<_> = photos.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["Bridge", "Bay"]);

        let calls = h.search.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].latitude, 37.7749);
        assert_eq!(calls[0].longitude, -122.4194);
        assert_eq!(calls[0].known_total_pages, None);
    }

    #[test]
    fn test_ensure_loaded_skips_search_when_photos_exist() {
        let mut h = harness(FakeFetcher::new(vec![]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        h.search.push(Ok(page(1, &[("a", Some("http://img/a.jpg"))])));

        h.coordinator.ensure_loaded(&pin).unwrap();
        let status = h.coordinator.ensure_loaded(&pin).unwrap();

        assert_eq!(status, AlbumStatus::Ready(1));
        assert_eq!(h.search.calls().len(), 1);
    }

    #[test]
    fn test_empty_search_is_not_an_error() {
        let mut h = harness(FakeFetcher::new(vec![]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        h.search.push(Ok(page(0, &[])));

        let status = h.coordinator.ensure_loaded(&pin).unwrap();
        assert_eq!(status, AlbumStatus::NoPhotos);
        assert_eq!(status.message(), Some(NO_PHOTOS_MESSAGE));
        assert_eq!(h.store.photo_count(&pin).unwrap(), 0);
        assert_eq!(h.coordinator.state(&pin), AlbumState::Loaded { photos: 0 });
    }

    #[test]
    fn test_hit_without_url_is_dropped() {
        let mut h = harness(FakeFetcher::new(vec![]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        h.search.push(Ok(page(1, &[("No url", None)])));

        assert_eq!(h.coordinator.ensure_loaded(&pin).unwrap(), AlbumStatus::NoPhotos);
        assert_eq!(h.store.photo_count(&pin).unwrap(), 0);
    }

    #[test]
    fn test_search_failure_is_surfaced_without_retry() {
        let mut h = harness(FakeFetcher::new(vec![]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        h.search.push(Err(Error::Server(500)));

        let err = h.coordinator.ensure_loaded(&pin).unwrap_err();
        assert!(matches!(err, Error::Server(500)));
        assert_eq!(h.coordinator.state(&pin), AlbumState::Loaded { photos: 0 });
        assert_eq!(h.search.calls().len(), 1);

        // Retrying is up to the user
        h.search.push(Ok(page(3, &[("a", Some("http://img/a.jpg"))])));
        assert_eq!(h.coordinator.ensure_loaded(&pin).unwrap(), AlbumStatus::Ready(1));
    }

    #[test]
    fn test_new_collection_replaces_photos_atomically() {
        let mut h = harness(FakeFetcher::new(vec![]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        h.search.push(Ok(page(
            500,
            &[("old1", Some("http://img/o1.jpg")), ("old2", Some("http://img/o2.jpg"))],
        )));
        h.coordinator.ensure_loaded(&pin).unwrap();
        let old_ids: Vec<i64> = h.store.list_photos(&pin).unwrap().iter().map(|p| p.id).collect();

        let rx = h.store.subscribe(&pin);
        h.search.push(Ok(page(500, &[("new1", Some("http://img/n1.jpg"))])));
        let status = h.coordinator.request_new_collection(&pin).unwrap();
        assert_eq!(status, AlbumStatus::Ready(1));

        let photos = h.store.list_photos(&pin).unwrap();
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].title, "new1");

        let deleted = rx.try_recv().unwrap();
        assert_eq!(deleted.deleted, old_ids);
        assert!(deleted.inserted.is_empty());
        let inserted = rx.try_recv().unwrap();
        assert_eq!(inserted.inserted, vec![photos[0].id]);
        assert!(inserted.deleted.is_empty());

        let calls = h.search.calls();
        assert_eq!(calls[1].known_total_pages, Some(500));
    }

    #[test]
    fn test_image_for_caches_bytes() {
        let mut h = harness(FakeFetcher::new(vec![0xFF, 0xD8]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        let photo = h.store.create_photo("a", "http://img/a.jpg", &pin).unwrap();
        h.store.save().unwrap();

        assert_eq!(h.coordinator.image_for(&photo).unwrap(), vec![0xFF, 0xD8]);
        // Stale copy without bytes still hits the cache
        assert_eq!(h.coordinator.image_for(&photo).unwrap(), vec![0xFF, 0xD8]);
        assert_eq!(h.fetcher.calls(), 1);

        let stored = h.store.get_photo(photo.id).unwrap().unwrap();
        assert_eq!(stored.image, Some(vec![0xFF, 0xD8]));
    }

    #[test]
    fn test_image_for_prefers_stored_bytes() {
        let mut h = harness(FakeFetcher::new(vec![1]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        let photo = h.store.create_photo("a", "http://img/a.jpg", &pin).unwrap();
        h.store.save().unwrap();
        h.store.update_photo_image(&photo, &[5, 6]).unwrap();
        h.store.save().unwrap();

        assert_eq!(h.coordinator.image_for(&photo).unwrap(), vec![5, 6]);
        assert_eq!(h.fetcher.calls(), 0);
    }

    #[test]
    fn test_image_for_failure_stores_nothing() {
        let mut h = harness(FakeFetcher::failing(404));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        let photo = h.store.create_photo("a", "http://img/a.jpg", &pin).unwrap();
        h.store.save().unwrap();

        assert!(matches!(h.coordinator.image_for(&photo), Err(Error::Server(404))));
        assert!(h.store.get_photo(photo.id).unwrap().unwrap().image.is_none());
    }

    #[test]
    fn test_background_load() {
        let mut h = harness(FakeFetcher::new(vec![]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        h.search.push(Ok(page(2, &[("a", Some("http://img/a.jpg"))])));

        assert_eq!(h.coordinator.begin_load(&pin, false).unwrap(), LoadRequest::Started);
        let notices = h.coordinator.wait_for_notices(WAIT);
        assert_eq!(
            notices,
            vec![AlbumNotice::Loaded {
                pin_id: pin.id,
                photos: 1
            }]
        );
        assert_eq!(
            h.coordinator.begin_load(&pin, false).unwrap(),
            LoadRequest::AlreadyLoaded(1)
        );
    }

    #[test]
    fn test_background_load_empty_and_failure() {
        let mut h = harness(FakeFetcher::new(vec![]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();

        h.search.push(Ok(page(0, &[])));
        h.coordinator.begin_load(&pin, false).unwrap();
        assert_eq!(
            h.coordinator.wait_for_notices(WAIT),
            vec![AlbumNotice::NoPhotos { pin_id: pin.id }]
        );

        h.search.push(Err(Error::Network("offline".to_string())));
        h.coordinator.begin_load(&pin, false).unwrap();
        let notices = h.coordinator.wait_for_notices(WAIT);
        assert_eq!(
            notices,
            vec![AlbumNotice::Alert {
                message: "Network error: offline".to_string()
            }]
        );
    }

    #[test]
    fn test_request_image_then_cached() {
        let mut h = harness(FakeFetcher::echo());
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        let photo = h.store.create_photo("a", "http://img/a.jpg", &pin).unwrap();
        h.store.save().unwrap();
        let rx = h.store.subscribe(&pin);

        assert_eq!(h.coordinator.request_image(&photo).unwrap(), ImageLookup::Pending);
        let notices = drain_images(&mut h.coordinator);
        assert_eq!(
            notices,
            vec![AlbumNotice::ImageReady {
                photo_id: photo.id,
                bytes: b"http://img/a.jpg".to_vec()
            }]
        );
        assert_eq!(rx.try_recv().unwrap().updated, vec![photo.id]);

        assert_eq!(
            h.coordinator.request_image(&photo).unwrap(),
            ImageLookup::Cached(b"http://img/a.jpg".to_vec())
        );
        assert_eq!(h.fetcher.calls(), 1);
    }

    #[test]
    fn test_shared_url_downloads_once() {
        let mut h = harness(FakeFetcher::gated(vec![3]));
        let first_pin = h.store.create_pin("1.0", "2.0").unwrap();
        let second_pin = h.store.create_pin("1.0", "2.0").unwrap();
        let a = h.store.create_photo("a", "http://img/same.jpg", &first_pin).unwrap();
        let b = h.store.create_photo("b", "http://img/same.jpg", &second_pin).unwrap();
        h.store.save().unwrap();

        h.coordinator.request_image(&a).unwrap();
        h.fetcher.wait_started();
        h.coordinator.request_image(&b).unwrap();
        h.fetcher.release();

        let notices = drain_images(&mut h.coordinator);
        assert_eq!(notices.len(), 2);
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.store.get_photo(a.id).unwrap().unwrap().image, Some(vec![3]));
        assert_eq!(h.store.get_photo(b.id).unwrap().unwrap().image, Some(vec![3]));
    }

    #[test]
    fn test_cancelled_image_is_never_stored() {
        let mut h = harness(FakeFetcher::gated(vec![7]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        let photo = h.store.create_photo("a", "http://img/a.jpg", &pin).unwrap();
        h.store.save().unwrap();
        let rx = h.store.subscribe(&pin);

        h.coordinator.request_image(&photo).unwrap();
        h.fetcher.wait_started();
        assert!(h.coordinator.cancel_image_for(&photo));

        let notices = h.coordinator.wait_for_notices(Duration::from_millis(500));
        assert!(notices.is_empty());
        assert!(!h.coordinator.is_alert_showing());
        assert!(h.store.get_photo(photo.id).unwrap().unwrap().image.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_only_one_alert_at_a_time() {
        let mut h = harness(FakeFetcher::failing(500));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        let a = h.store.create_photo("a", "http://img/a.jpg", &pin).unwrap();
        let b = h.store.create_photo("b", "http://img/b.jpg", &pin).unwrap();
        h.store.save().unwrap();

        h.coordinator.request_image(&a).unwrap();
        h.coordinator.request_image(&b).unwrap();
        let notices = drain_images(&mut h.coordinator);

        let alerts: Vec<_> = notices
            .iter()
            .filter(|n| matches!(n, AlbumNotice::Alert { .. }))
            .collect();
        assert_eq!(alerts.len(), 1);
        assert!(h.coordinator.is_alert_showing());

        h.coordinator.acknowledge_alert();
        h.coordinator.request_image(&a).unwrap();
        let notices = drain_images(&mut h.coordinator);
        assert_eq!(
            notices,
            vec![AlbumNotice::Alert {
                message: "Error while fetching photo for URL: http://img/a.jpg".to_string()
            }]
        );
    }

    #[test]
    fn test_delete_photo_and_all_photos() {
        let mut h = harness(FakeFetcher::new(vec![]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        h.search.push(Ok(page(
            1,
            &[
                ("a", Some("http://img/a.jpg")),
                ("b", Some("http://img/b.jpg")),
                ("c", Some("http://img/c.jpg")),
            ],
        )));
        h.coordinator.ensure_loaded(&pin).unwrap();

        let photos = h.store.list_photos(&pin).unwrap();
        h.coordinator.delete_photo(&photos[0]).unwrap();
        assert_eq!(h.store.photo_count(&pin).unwrap(), 2);
        assert_eq!(h.coordinator.state(&pin), AlbumState::Loaded { photos: 2 });

        assert_eq!(h.coordinator.delete_all_photos(&pin).unwrap(), 2);
        assert_eq!(h.store.photo_count(&pin).unwrap(), 0);
    }

    #[test]
    fn test_delete_pin_cancels_downloads() {
        let mut h = harness(FakeFetcher::gated(vec![1]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        let photo = h.store.create_photo("a", "http://img/a.jpg", &pin).unwrap();
        h.store.save().unwrap();

        h.coordinator.request_image(&photo).unwrap();
        h.fetcher.wait_started();
        h.coordinator.delete_pin(&pin).unwrap();

        assert_eq!(h.coordinator.pending_image_count(), 0);
        assert!(h.coordinator.wait_for_notices(Duration::from_millis(500)).is_empty());
        assert!(h.store.find_pin("1.0", "2.0").unwrap().is_none());
        assert_eq!(h.coordinator.state(&pin), AlbumState::Empty);
    }

    #[test]
    fn test_rerequest_after_cancel_gets_image() {
        let mut h = harness(FakeFetcher::gated(vec![7]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        let photo = h.store.create_photo("a", "http://img/a.jpg", &pin).unwrap();
        h.store.save().unwrap();

        h.coordinator.request_image(&photo).unwrap();
        h.fetcher.wait_started();
        assert!(h.coordinator.cancel_image_for(&photo));

        // The cancelled transfer reports back while the second one is running
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(h.coordinator.request_image(&photo).unwrap(), ImageLookup::Pending);
        h.fetcher.wait_started();
        h.fetcher.release();

        let notices = drain_images(&mut h.coordinator);
        assert_eq!(
            notices,
            vec![AlbumNotice::ImageReady {
                photo_id: photo.id,
                bytes: vec![7]
            }]
        );
        assert_eq!(h.fetcher.calls(), 2);
        assert_eq!(h.store.get_photo(photo.id).unwrap().unwrap().image, Some(vec![7]));
    }

    #[test]
    fn test_new_collection_supersedes_background_load() {
        let mut h = harness(FakeFetcher::new(vec![]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        h.search.push(Ok(page(
            10,
            &[("bg1", Some("http://img/bg1.jpg")), ("bg2", Some("http://img/bg2.jpg"))],
        )));
        h.search.push(Ok(page(10, &[("new1", Some("http://img/n1.jpg"))])));

        assert_eq!(h.coordinator.begin_load(&pin, false).unwrap(), LoadRequest::Started);
        h.search.wait_for_calls(1);
        assert_eq!(
            h.coordinator.request_new_collection(&pin).unwrap(),
            AlbumStatus::Ready(1)
        );

        assert!(h.coordinator.wait_for_notices(Duration::from_millis(300)).is_empty());
        let titles: Vec<_> = h
            .store
            .list_photos(&pin)
            .unwrap()
            .into_iter()
            .map(|p| p.title)
            .collect();
        assert_eq!(titles, vec!["new1"]);
        assert_eq!(h.coordinator.state(&pin), AlbumState::Loaded { photos: 1 });
    }

    #[test]
    fn test_ensure_loaded_supersedes_background_load() {
        let mut h = harness(FakeFetcher::new(vec![]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        h.search.push(Ok(page(10, &[("bg1", Some("http://img/bg1.jpg"))])));
        h.search.push(Ok(page(10, &[("now1", Some("http://img/now1.jpg"))])));

        h.coordinator.begin_load(&pin, false).unwrap();
        h.search.wait_for_calls(1);
        assert_eq!(h.coordinator.ensure_loaded(&pin).unwrap(), AlbumStatus::Ready(1));

        assert!(h.coordinator.wait_for_notices(Duration::from_millis(300)).is_empty());
        let photos = h.store.list_photos(&pin).unwrap();
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].title, "now1");
    }

    #[test]
    fn test_deleting_pin_drops_background_load() {
        let mut h = harness(FakeFetcher::new(vec![]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        h.search.push(Ok(page(5, &[("a", Some("http://img/a.jpg"))])));

        h.coordinator.begin_load(&pin, false).unwrap();
        h.search.wait_for_calls(1);
        h.coordinator.delete_pin(&pin).unwrap();

        assert!(h.coordinator.wait_for_notices(Duration::from_millis(300)).is_empty());
        assert!(!h.coordinator.is_alert_showing());
        assert!(!h.store.has_pending_changes());
        assert_eq!(h.coordinator.state(&pin), AlbumState::Empty);
        assert_eq!(h.coordinator.known_total_pages(&pin), None);
    }

    #[test]
    fn test_pin_deleted_behind_coordinator_drops_background_load() {
        let mut h = harness(FakeFetcher::new(vec![]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        h.search.push(Ok(page(5, &[("a", Some("http://img/a.jpg"))])));

        h.coordinator.begin_load(&pin, false).unwrap();
        h.search.wait_for_calls(1);
        h.store.delete_pin(&pin).unwrap();

        assert!(h.coordinator.wait_for_notices(Duration::from_millis(300)).is_empty());
        assert!(!h.store.has_pending_changes());
        assert_eq!(h.coordinator.state(&pin), AlbumState::Empty);
    }

    /// Deletes the pin while the search is running.
    struct DeletingSearch {
        store: Arc<Store>,
        pin: Pin,
    }

    impl PhotoSearch for DeletingSearch {
        fn search(&self, _: f64, _: f64, _: Option<u32>) -> Result<SearchResultPage> {
            self.store.delete_pin(&self.pin).unwrap();
            Ok(page(1, &[("a", Some("http://img/a.jpg")), ("b", Some("http://img/b.jpg"))]))
        }
    }

    #[test]
    fn test_failed_batch_leaves_nothing_staged() {
        let h = harness(FakeFetcher::new(vec![]));
        let pin = h.store.create_pin("1.0", "2.0").unwrap();
        let search = Arc::new(DeletingSearch {
            store: Arc::clone(&h.store),
            pin: pin.clone(),
        });
        let mut coordinator =
            AlbumCoordinator::new(Arc::clone(&h.store), search, DownloadManager::new(h.fetcher.clone()));

        let err = coordinator.ensure_loaded(&pin).unwrap_err();
        assert!(err.is_persistence());
        assert!(!h.store.has_pending_changes());

        // An unrelated save afterwards commits nothing from the failed batch
        let other = h.store.create_pin("3.0", "4.0").unwrap();
        h.store.save().unwrap();
        assert_eq!(h.store.photo_count(&pin).unwrap(), 0);
        assert_eq!(h.store.photo_count(&other).unwrap(), 0);
    }
}

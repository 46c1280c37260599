//! Local store of pins and photos.
//!
//! All mutations go through a single writer connection guarded by a mutex.
//! Photo mutations accumulate in an open transaction until [`Store::save`]
//! commits them; reads use a second connection and therefore only ever see
//! committed rows. Every successful commit emits one [`PhotoChanges`] batch
//! to each subscriber whose pin was touched.

mod changes;
mod schema;
pub mod sqlite;

use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};

pub use changes::{ChangeKind, PhotoChanges};
pub use schema::SCHEMA;

use changes::{ChangeSet, Subscriber};
use sqlite::SqliteDb;

/// A saved map location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pin {
    pub id: i64,
    pub latitude: String,
    pub longitude: String,
    pub created_at: String,
}

impl Pin {
    /// Parsed `(latitude, longitude)` in degrees.
    pub fn coordinate(&self) -> Result<(f64, f64)> {
        parse_coordinate(&self.latitude, &self.longitude)
    }
}

/// One search result attached to a pin, with its bytes once downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Photo {
    pub id: i64,
    pub pin_id: i64,
    pub title: String,
    pub source_url: String,
    pub image: Option<Vec<u8>>,
}

impl Photo {
    pub fn is_cached(&self) -> bool {
        self.image.is_some()
    }
}

/// Parse and range-check a coordinate pair given as decimal strings.
pub fn parse_coordinate(latitude: &str, longitude: &str) -> Result<(f64, f64)> {
    let lat: f64 = latitude
        .trim()
        .parse()
        .map_err(|_| Error::InvalidCoordinate(format!("latitude {:?}", latitude)))?;
    let lon: f64 = longitude
        .trim()
        .parse()
        .map_err(|_| Error::InvalidCoordinate(format!("longitude {:?}", longitude)))?;

    if !(-90.0..=90.0).contains(&lat) {
        return Err(Error::InvalidCoordinate(format!("latitude {} out of range", lat)));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(Error::InvalidCoordinate(format!("longitude {} out of range", lon)));
    }
    Ok((lat, lon))
}

struct Writer {
    db: SqliteDb,
    pending: ChangeSet,
}

pub struct Store {
    writer: Mutex<Writer>,
    reader: Mutex<SqliteDb>,
    subscribers: Mutex<Vec<Subscriber>>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock leaves SQLite itself consistent
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Store {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let writer = SqliteDb::open(path)?;
        let reader = SqliteDb::open(path)?;
        Ok(Self {
            writer: Mutex::new(Writer {
                db: writer,
                pending: ChangeSet::default(),
            }),
            reader: Mutex::new(reader),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn initialize(&self) -> Result<()> {
        lock(&self.writer).db.initialize()
    }

    // ========================================================================
    // Pins
    // ========================================================================

    /// Insert and commit a new pin. Duplicate coordinates are allowed.
    pub fn create_pin(&self, latitude: &str, longitude: &str) -> Result<Pin> {
        parse_coordinate(latitude, longitude)?;
        let created_at = now();
        let id = {
            let writer = lock(&self.writer);
            writer.db.begin()?;
            writer.db.insert_pin(latitude, longitude, &created_at)?
        };
        self.save()?;
        tracing::info!(pin_id = id, latitude, longitude, "Pin created");

        Ok(Pin {
            id,
            latitude: latitude.to_string(),
            longitude: longitude.to_string(),
            created_at,
        })
    }

    pub fn get_pin(&self, pin_id: i64) -> Result<Option<Pin>> {
        lock(&self.reader).get_pin(pin_id)
    }

    pub fn list_pins(&self) -> Result<Vec<Pin>> {
        lock(&self.reader).get_pins()
    }

    /// Exact string match on both coordinates. When several pins share the
    /// coordinate the oldest one wins.
    pub fn find_pin(&self, latitude: &str, longitude: &str) -> Result<Option<Pin>> {
        lock(&self.reader).find_pin(latitude, longitude)
    }

    /// Delete a pin and all of its photos, committed before returning.
    pub fn delete_pin(&self, pin: &Pin) -> Result<()> {
        {
            let mut writer = lock(&self.writer);
            writer.db.begin()?;
            let photo_ids = writer.db.get_photo_ids_for_pin(pin.id)?;
            writer.db.delete_pin(pin.id)?;
            for photo_id in photo_ids {
                writer.pending.record(pin.id, photo_id, ChangeKind::Delete);
            }
        }
        self.save()?;
        tracing::info!(pin_id = pin.id, "Pin deleted");
        Ok(())
    }

    // ========================================================================
    // Photos
    // ========================================================================

    pub fn list_photos(&self, pin: &Pin) -> Result<Vec<Photo>> {
        lock(&self.reader).get_photos_for_pin(pin.id)
    }

    pub fn photo_count(&self, pin: &Pin) -> Result<usize> {
        lock(&self.reader).count_photos_for_pin(pin.id)
    }

    pub fn get_photo(&self, photo_id: i64) -> Result<Option<Photo>> {
        lock(&self.reader).get_photo(photo_id)
    }

    /// Stage a new photo for `pin`. Visible to readers after [`Store::save`].
    pub fn create_photo(&self, title: &str, url: &str, pin: &Pin) -> Result<Photo> {
        let mut writer = lock(&self.writer);
        writer.db.begin()?;
        let id = writer.db.insert_photo(pin.id, title, url, &now())?;
        writer.pending.record(pin.id, id, ChangeKind::Insert);

        Ok(Photo {
            id,
            pin_id: pin.id,
            title: title.to_string(),
            source_url: url.to_string(),
            image: None,
        })
    }

    pub fn delete_photo(&self, photo: &Photo) -> Result<()> {
        let mut writer = lock(&self.writer);
        writer.db.begin()?;
        if writer.db.delete_photo(photo.id)? > 0 {
            writer.pending.record(photo.pin_id, photo.id, ChangeKind::Delete);
        }
        Ok(())
    }

    /// Stage deletion of every photo of `pin`. Returns how many were removed.
    pub fn delete_photos_for_pin(&self, pin: &Pin) -> Result<usize> {
        let mut writer = lock(&self.writer);
        writer.db.begin()?;
        let ids = writer.db.get_photo_ids_for_pin(pin.id)?;
        for id in &ids {
            writer.db.delete_photo(*id)?;
            writer.pending.record(pin.id, *id, ChangeKind::Delete);
        }
        Ok(ids.len())
    }

    /// Stage the downloaded bytes for `photo`. A photo deleted in the
    /// meantime is left alone.
    pub fn update_photo_image(&self, photo: &Photo, image: &[u8]) -> Result<()> {
        let mut writer = lock(&self.writer);
        writer.db.begin()?;
        if writer.db.update_photo_image(photo.id, image, &now())? == 0 {
            tracing::debug!(photo_id = photo.id, "Image arrived for a deleted photo, ignoring");
            return Ok(());
        }
        writer.pending.record(photo.pin_id, photo.id, ChangeKind::Update);
        Ok(())
    }

    // ========================================================================
    // Persistence and notifications
    // ========================================================================

    pub fn has_pending_changes(&self) -> bool {
        let writer = lock(&self.writer);
        writer.db.in_transaction() || !writer.pending.is_empty()
    }

    /// Commit staged mutations and notify subscribers.
    ///
    /// On failure nothing is retried. If SQLite kept the transaction open the
    /// staged work stays queued for the next save; if it rolled back, the
    /// queued notifications are discarded with it.
    pub fn save(&self) -> Result<()> {
        let mut writer = lock(&self.writer);
        if let Err(e) = writer.db.commit() {
            tracing::error!(error = %e, "Failed to commit pending changes");
            if !writer.db.in_transaction() {
                writer.pending.clear();
            }
            return Err(e);
        }

        if writer.pending.is_empty() {
            return Ok(());
        }

        // Published under the writer lock so batches arrive in commit order
        let mut subscribers = lock(&self.subscribers);
        changes::publish(&mut subscribers, &writer.pending);
        writer.pending.clear();
        Ok(())
    }

    /// Discard every staged mutation along with its queued notifications.
    pub fn rollback(&self) -> Result<()> {
        let mut writer = lock(&self.writer);
        writer.pending.clear();
        writer.db.rollback()
    }

    /// Commit on the blocking pool so async callers are not stalled by disk I/O.
    pub async fn flush(self: &Arc<Self>) -> Result<()> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.save())
            .await
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    /// Receive a [`PhotoChanges`] batch after every save that touched `pin`.
    pub fn subscribe(&self, pin: &Pin) -> mpsc::Receiver<PhotoChanges> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(Subscriber { pin_id: pin.id, tx });
        rx
    }
}

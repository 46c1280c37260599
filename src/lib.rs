//! Location bookmarks with a lazily fetched, locally cached photo album per pin.
//!
//! Build the pieces once and hand them to the coordinator:
//!
//! ```no_run
//! use std::sync::Arc;
//! use pinbook::{AlbumCoordinator, Config, DownloadManager, FlickrClient, Store};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let store = Arc::new(Store::open(&config.db_path)?);
//! store.initialize()?;
//!
//! let search = Arc::new(FlickrClient::from_config(&config.search));
//! let downloads = DownloadManager::from_config(&config.download);
//! let mut album = AlbumCoordinator::new(store.clone(), search, downloads);
//!
//! let pin = store.create_pin("37.7749", "-122.4194")?;
//! album.ensure_loaded(&pin)?;
//! # Ok(())
//! # }
//! ```

pub mod album;
pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod logging;
pub mod search;

#[cfg(test)]
mod test_support;

pub use album::{AlbumCoordinator, AlbumNotice, AlbumState, AlbumStatus, ImageLookup, LoadRequest};
pub use config::Config;
pub use db::{Photo, PhotoChanges, Pin, Store};
pub use download::{DownloadManager, HttpFetcher, ImageFetcher, TransferId};
pub use error::{Error, Result};
pub use search::{FlickrClient, PhotoSearch, SearchResultPage};

//! Geographic photo search against Flickr's `photos.search`.

pub mod client;

use rand::Rng;
use serde::Deserialize;

use crate::error::{Error, Result};

pub use client::FlickrClient;

/// Results requested per page.
pub const PER_PAGE: u32 = 20;

/// Flickr stops returning distinct results past this many photos.
pub const MAX_RESULTS: u32 = 4000;

/// Half the side of the search box, in degrees.
pub const BBOX_HALF_WIDTH: f64 = 0.2;
pub const BBOX_HALF_HEIGHT: f64 = 0.2;

pub const LAT_RANGE: (f64, f64) = (-90.0, 90.0);
pub const LON_RANGE: (f64, f64) = (-180.0, 180.0);

/// Trait for services that can look up photos around a coordinate.
pub trait PhotoSearch: Send + Sync {
    /// Fetch one page of results. With `known_total_pages` set a random page
    /// is requested, otherwise the first.
    fn search(
        &self,
        latitude: f64,
        longitude: f64,
        known_total_pages: Option<u32>,
    ) -> Result<SearchResultPage>;
}

/// One entry of a search page. `url` is absent when the service has no
/// medium-size rendition for the photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchResultPage {
    pub total_pages: u32,
    pub photos: Vec<SearchHit>,
}

/// Pick the page to request.
pub fn choose_page<R: Rng + ?Sized>(known_total_pages: Option<u32>, rng: &mut R) -> u32 {
    match known_total_pages {
        None => 1,
        Some(total) => {
            let capped = total.min(MAX_RESULTS / PER_PAGE).max(1);
            rng.gen_range(1..=capped)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn around(latitude: f64, longitude: f64) -> Self {
        Self {
            min_lon: (longitude - BBOX_HALF_WIDTH).max(LON_RANGE.0),
            min_lat: (latitude - BBOX_HALF_HEIGHT).max(LAT_RANGE.0),
            max_lon: (longitude + BBOX_HALF_WIDTH).min(LON_RANGE.1),
            max_lat: (latitude + BBOX_HALF_HEIGHT).min(LAT_RANGE.1),
        }
    }

    /// `minLon,minLat,maxLon,maxLat` as the `bbox` parameter expects.
    pub fn to_param(&self) -> String {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
            .iter()
            .map(|v| format_degrees(*v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Six decimal places with trailing zeros trimmed.
fn format_degrees(value: f64) -> String {
    let s = format!("{:.6}", value);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    photos: Option<PhotosBody>,
    #[serde(default)]
    stat: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PhotosBody {
    pages: u32,
    photo: Vec<RawPhoto>,
}

#[derive(Debug, Deserialize)]
struct RawPhoto {
    #[serde(default)]
    url_m: Option<String>,
    title: String,
}

/// Decode a `photos.search` JSON body.
pub fn parse_search_response(body: &str) -> Result<SearchResultPage> {
    let envelope: SearchEnvelope =
        serde_json::from_str(body).map_err(|e| Error::Decode(e.to_string()))?;

    if envelope.stat.as_deref() == Some("fail") {
        return Err(Error::Decode(
            envelope
                .message
                .unwrap_or_else(|| "search request failed".to_string()),
        ));
    }

    let photos = envelope
        .photos
        .ok_or_else(|| Error::Decode("missing `photos` object".to_string()))?;

    Ok(SearchResultPage {
        total_pages: photos.pages,
        photos: photos
            .photo
            .into_iter()
            .map(|p| SearchHit {
                title: p.title,
                url: p.url_m,
            })
            .collect(),
    })
}

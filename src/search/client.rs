use std::time::Duration;

use super::{choose_page, parse_search_response, BoundingBox, PhotoSearch, SearchResultPage, PER_PAGE};
use crate::config::SearchConfig;
use crate::error::{Error, Result};

pub const SEARCH_METHOD: &str = "flickr.photos.search";

/// Size variant requested through `extras`; its key is what carries the URL.
pub const MEDIUM_URL: &str = "url_m";

/// HTTP client for Flickr's REST endpoint.
pub struct FlickrClient {
    agent: ureq::Agent,
    endpoint: String,
    api_key: String,
}

impl FlickrClient {
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn from_config(config: &SearchConfig) -> Self {
        Self::new(
            &config.endpoint,
            &config.resolved_api_key().unwrap_or_default(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Query string for one search request, in a stable order.
    pub fn query_params(&self, bbox: &BoundingBox, page: u32) -> Vec<(&'static str, String)> {
        vec![
            ("method", SEARCH_METHOD.to_string()),
            ("api_key", self.api_key.clone()),
            ("bbox", bbox.to_param()),
            ("safe_search", "1".to_string()),
            ("extras", MEDIUM_URL.to_string()),
            ("format", "json".to_string()),
            ("nojsoncallback", "1".to_string()),
            ("per_page", PER_PAGE.to_string()),
            ("page", page.to_string()),
        ]
    }
}

impl PhotoSearch for FlickrClient {
    fn search(
        &self,
        latitude: f64,
        longitude: f64,
        known_total_pages: Option<u32>,
    ) -> Result<SearchResultPage> {
        let page = choose_page(known_total_pages, &mut rand::thread_rng());
        let bbox = BoundingBox::around(latitude, longitude);

        tracing::info!(latitude, longitude, page, bbox = %bbox.to_param(), "Searching photos");

        let mut request = self.agent.get(&self.endpoint);
        for (key, value) in self.query_params(&bbox, page) {
            request = request.query(key, &value);
        }

        let response = request.call()?;
        let body = response
            .into_string()
            .map_err(|e| Error::Network(format!("Failed to read search response: {}", e)))?;

        let result = parse_search_response(&body)?;
        tracing::debug!(
            total_pages = result.total_pages,
            hits = result.photos.len(),
            "Search completed"
        );
        Ok(result)
    }
}

//! Tile sources and concurrent tile fetching
//!
//! A [`TileSource`] turns a tile coordinate into raw bytes. The pipeline only
//! sees this trait, so HTTP endpoints, local tile directories and in-memory
//! fixtures are interchangeable.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{MapError, MapResult};
use crate::tiles::Tile;

/// Default timeout for a single tile request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default user agent sent to tile servers
pub const DEFAULT_USER_AGENT: &str = concat!("terramesh/", env!("CARGO_PKG_VERSION"));

/// Trait for raw tile providers
#[async_trait]
pub trait TileSource: Send + Sync {
    /// Fetch the raw payload of one tile
    async fn fetch(&self, tile: Tile) -> MapResult<Vec<u8>>;

    /// Human-readable description used in logs
    fn describe(&self) -> String;
}

/// Build the HTTP client shared by tile and style requests
pub fn build_http_client(timeout: Duration, user_agent: &str) -> MapResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()
        .map_err(MapError::from)
}

/// Fetch and parse a JSON document (map styles, TileJSON)
pub async fn fetch_json<T: DeserializeOwned>(client: &reqwest::Client, url: &str) -> MapResult<T> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(MapError::Network {
            tile: None,
            message: format!("status {} from {}", status, url),
        });
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(MapError::from)
}

/// Tiles served over HTTP from a `{z}/{x}/{y}` URL template
#[derive(Debug, Clone)]
pub struct HttpTileSource {
    client: reqwest::Client,
    template: String,
}

impl HttpTileSource {
    /// Create a source with its own client using default timeout and user agent
    pub fn new(template: impl Into<String>) -> MapResult<Self> {
        let client = build_http_client(DEFAULT_TIMEOUT, DEFAULT_USER_AGENT)?;
        Ok(Self::with_client(client, template))
    }

    /// Create a source sharing an existing client
    pub fn with_client(client: reqwest::Client, template: impl Into<String>) -> Self {
        Self {
            client,
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

#[async_trait]
impl TileSource for HttpTileSource {
    async fn fetch(&self, tile: Tile) -> MapResult<Vec<u8>> {
        let url = tile.fill_template(&self.template);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MapError::network(tile, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MapError::network(
                tile,
                format!("status {} from {}", status, url),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| MapError::network(tile, e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn describe(&self) -> String {
        self.template.clone()
    }
}

/// Tiles stored on disk, addressed by a relative `{z}/{x}/{y}.ext` template
#[derive(Debug, Clone)]
pub struct FileTileSource {
    root: PathBuf,
    template: String,
}

impl FileTileSource {
    pub fn new(root: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            template: template.into(),
        }
    }

    /// Path the given tile would be read from
    pub fn path_for(&self, tile: Tile) -> PathBuf {
        self.root.join(tile.fill_template(&self.template))
    }
}

#[async_trait]
impl TileSource for FileTileSource {
    async fn fetch(&self, tile: Tile) -> MapResult<Vec<u8>> {
        let path = self.path_for(tile);
        tokio::fs::read(&path)
            .await
            .map_err(|e| MapError::network(tile, format!("{}: {}", path.display(), e)))
    }

    fn describe(&self) -> String {
        self.root.join(&self.template).display().to_string()
    }
}

/// Tiles held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryTileSource {
    tiles: HashMap<Tile, Vec<u8>>,
    name: String,
}

impl MemoryTileSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            tiles: HashMap::new(),
            name: name.into(),
        }
    }

    /// Add a tile payload
    pub fn with_tile(mut self, tile: Tile, bytes: Vec<u8>) -> Self {
        self.tiles.insert(tile, bytes);
        self
    }

    pub fn insert(&mut self, tile: Tile, bytes: Vec<u8>) {
        self.tiles.insert(tile, bytes);
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

#[async_trait]
impl TileSource for MemoryTileSource {
    async fn fetch(&self, tile: Tile) -> MapResult<Vec<u8>> {
        self.tiles
            .get(&tile)
            .cloned()
            .ok_or_else(|| MapError::network(tile, format!("not present in {}", self.name)))
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }
}

/// Inflate gzip-wrapped payloads, pass everything else through
pub fn maybe_gunzip(bytes: Vec<u8>) -> MapResult<Vec<u8>> {
    if bytes.len() < 2 || bytes[0] != 0x1f || bytes[1] != 0x8b {
        return Ok(bytes);
    }
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| MapError::decode("gzip", e))?;
    Ok(inflated)
}

/// Fetch every tile concurrently
///
/// A failed tile is logged and left out of the result; it never cancels its
/// siblings. If `cancel` fires first, all in-flight fetches are dropped and
/// `MapError::Cancelled` is returned.
pub async fn fetch_all(
    source: &dyn TileSource,
    tiles: &[Tile],
    cancel: &CancellationToken,
) -> MapResult<Vec<(Tile, Vec<u8>)>> {
    let fetches = tiles.iter().map(|&tile| async move {
        let result = match source.fetch(tile).await {
            Ok(bytes) => maybe_gunzip(bytes),
            Err(e) => Err(e),
        };
        (tile, result)
    });

    let results = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(MapError::Cancelled),
        results = join_all(fetches) => results,
    };

    let mut fetched = Vec::with_capacity(results.len());
    for (tile, result) in results {
        match result {
            Ok(bytes) => {
                debug!(%tile, bytes = bytes.len(), "fetched tile");
                fetched.push((tile, bytes));
            }
            Err(e) => warn!(%tile, source = %source.describe(), error = %e, "skipping tile"),
        }
    }
    Ok(fetched)
}

//! Error types for the mesh synthesis pipeline

use crate::tiles::Tile;

/// Errors that can occur while turning a bounding box into a mesh
///
/// Per-item errors (`Network`, `Decode`, `Validation`) are absorbed at the
/// smallest scope: the tile or feature is dropped and the pipeline continues.
/// `Configuration` aborts a request before any fetch is issued.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// A tile fetch failed (connection, timeout, non-success status)
    #[error("Network error{}: {message}", tile_suffix(.tile))]
    Network {
        tile: Option<Tile>,
        message: String,
    },

    /// A payload could not be decoded (bad image, bad protobuf, bad JSON)
    #[error("Decode error ({what}): {message}")]
    Decode { what: String, message: String },

    /// A feature failed validation (non-finite coordinate, ring too short)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Top-level input or configuration is unusable
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A resource was missing; resolved with a fallback, reported for diagnostics
    #[error("Resource unavailable: {0}")]
    Resource(String),

    /// The request was superseded by a newer one
    #[error("Generation cancelled")]
    Cancelled,

    /// A background worker panicked or was aborted
    #[error("Worker task failed: {0}")]
    Worker(String),

    /// Local file access failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn tile_suffix(tile: &Option<Tile>) -> String {
    match tile {
        Some(tile) => format!(" for tile {}", tile),
        None => String::new(),
    }
}

/// Result type for pipeline operations
pub type MapResult<T> = std::result::Result<T, MapError>;

impl MapError {
    /// Create a network error for a specific tile
    pub fn network(tile: Tile, message: impl Into<String>) -> Self {
        MapError::Network {
            tile: Some(tile),
            message: message.into(),
        }
    }

    /// Create a decode error
    pub fn decode(what: impl Into<String>, message: impl ToString) -> Self {
        MapError::Decode {
            what: what.into(),
            message: message.to_string(),
        }
    }

    /// Returns true if this error only drops one tile or feature
    pub fn is_item_scoped(&self) -> bool {
        matches!(
            self,
            MapError::Network { .. } | MapError::Decode { .. } | MapError::Validation(_)
        )
    }
}

impl From<reqwest::Error> for MapError {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("request timed out: {}", err)
        } else if err.is_connect() {
            format!("connection failed: {}", err)
        } else {
            err.to_string()
        };
        MapError::Network {
            tile: None,
            message,
        }
    }
}

impl From<image::ImageError> for MapError {
    fn from(err: image::ImageError) -> Self {
        MapError::decode("image", err)
    }
}

impl From<tokio::task::JoinError> for MapError {
    fn from(err: tokio::task::JoinError) -> Self {
        MapError::Worker(err.to_string())
    }
}

impl From<serde_json::Error> for MapError {
    fn from(err: serde_json::Error) -> Self {
        MapError::decode("json", err)
    }
}

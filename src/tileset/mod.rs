//! Tile set identity.
//!
//! A tile set groups the cached tiles that share a layer, gridset, blob
//! format and (optionally) a request-parameters id. Its canonical key is
//! the storage key for all quota accounting records, so the key codec here
//! must stay stable across releases.

use std::fmt;

/// Separator between the key segments.
const KEY_SEPARATOR: char = '#';

/// Reserved tile set id under which the cache-wide usage aggregate is kept.
///
/// Stored in the same table as ordinary per-tile-set aggregates so it takes
/// part in the same transactions.
pub const GLOBAL_QUOTA_ID: &str = "___GLOBAL_QUOTA___";

/// Immutable identity of a tile set.
///
/// Two tile sets are equal iff their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileSet {
    key: String,
    layer_name: String,
    gridset_id: String,
    blob_format: String,
    parameters_id: Option<String>,
}

impl TileSet {
    /// Create a tile set identity and compute its canonical key.
    ///
    /// The key is `layer#gridset#format` with a `#parametersId` suffix when
    /// a parameters id is present.
    pub fn new(
        layer_name: impl Into<String>,
        gridset_id: impl Into<String>,
        blob_format: impl Into<String>,
        parameters_id: Option<String>,
    ) -> Self {
        let layer_name = layer_name.into();
        let gridset_id = gridset_id.into();
        let blob_format = blob_format.into();

        let mut key = String::with_capacity(
            layer_name.len()
                + gridset_id.len()
                + blob_format.len()
                + parameters_id.as_ref().map_or(0, |p| p.len() + 1)
                + 2,
        );
        key.push_str(&layer_name);
        key.push(KEY_SEPARATOR);
        key.push_str(&gridset_id);
        key.push(KEY_SEPARATOR);
        key.push_str(&blob_format);
        if let Some(params) = &parameters_id {
            key.push(KEY_SEPARATOR);
            key.push_str(params);
        }

        Self {
            key,
            layer_name,
            gridset_id,
            blob_format,
            parameters_id,
        }
    }

    /// The distinguished tile set owning the global usage aggregate.
    pub fn global() -> Self {
        Self {
            key: GLOBAL_QUOTA_ID.to_string(),
            layer_name: GLOBAL_QUOTA_ID.to_string(),
            gridset_id: String::new(),
            blob_format: String::new(),
            parameters_id: None,
        }
    }

    /// Whether this is the global sentinel tile set.
    pub fn is_global(&self) -> bool {
        self.key == GLOBAL_QUOTA_ID
    }

    /// Canonical storage key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owning layer name.
    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    /// Gridset id.
    pub fn gridset_id(&self) -> &str {
        &self.gridset_id
    }

    /// Blob (image) format.
    pub fn blob_format(&self) -> &str {
        &self.blob_format
    }

    /// Request-parameters id, if the tile set is parameterized.
    pub fn parameters_id(&self) -> Option<&str> {
        self.parameters_id.as_deref()
    }

    /// Extract the layer name from a tile set key without building a full
    /// identity. Returns the whole key if it has no separator (the global
    /// sentinel decodes to itself).
    pub fn layer_name_from_key(key: &str) -> &str {
        key.split(KEY_SEPARATOR).next().unwrap_or(key)
    }
}

impl fmt::Display for TileSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_without_parameters() {
        let ts = TileSet::new("roads", "EPSG:4326", "image/png", None);
        assert_eq!(ts.key(), "roads#EPSG:4326#image/png");
    }

    #[test]
    fn key_with_parameters() {
        let ts = TileSet::new(
            "roads",
            "EPSG:4326",
            "image/png",
            Some("a1b2c3".to_string()),
        );
        assert_eq!(ts.key(), "roads#EPSG:4326#image/png#a1b2c3");
        assert_eq!(ts.parameters_id(), Some("a1b2c3"));
    }

    #[test]
    fn equality_follows_key() {
        let a = TileSet::new("roads", "EPSG:4326", "image/png", None);
        let b = TileSet::new("roads", "EPSG:4326", "image/png", None);
        let c = TileSet::new("roads", "EPSG:4326", "image/jpeg", None);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn layer_name_from_key_decodes_first_segment() {
        assert_eq!(
            TileSet::layer_name_from_key("roads#EPSG:4326#image/png"),
            "roads"
        );
        assert_eq!(TileSet::layer_name_from_key(GLOBAL_QUOTA_ID), GLOBAL_QUOTA_ID);
    }

    #[test]
    fn global_sentinel() {
        let global = TileSet::global();
        assert!(global.is_global());
        assert_eq!(global.key(), GLOBAL_QUOTA_ID);
        assert!(!TileSet::new("roads", "g", "f", None).is_global());
    }
}

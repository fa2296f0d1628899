//! Upload metadata
//!
//! The `Upload-Metadata` header carries comma-separated `key base64(value)`
//! pairs; the value may be omitted. [`MetadataSchema`] describes which keys
//! a mount requires or accepts.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::types::ValidationError;

/// Decoded upload metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an `Upload-Metadata` header value
    pub fn parse_header(value: &str) -> Result<Self, ValidationError> {
        let mut entries = BTreeMap::new();

        for pair in value.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }

            let mut parts = pair.splitn(2, ' ');
            let key = parts.next().unwrap_or_default();
            if key.is_empty() || !key.is_ascii() {
                return Err(ValidationError::MalformedMetadata(format!(
                    "invalid key in {:?}",
                    pair
                )));
            }

            let decoded = match parts.next().map(str::trim) {
                None | Some("") => String::new(),
                Some(encoded) => {
                    let bytes = STANDARD.decode(encoded).map_err(|e| {
                        ValidationError::MalformedMetadata(format!(
                            "value for {} is not base64: {}",
                            key, e
                        ))
                    })?;
                    String::from_utf8(bytes).map_err(|_| {
                        ValidationError::MalformedMetadata(format!(
                            "value for {} is not UTF-8",
                            key
                        ))
                    })?
                }
            };

            if entries.insert(key.to_string(), decoded).is_some() {
                return Err(ValidationError::MalformedMetadata(format!(
                    "duplicate key {}",
                    key
                )));
            }
        }

        Ok(Self(entries))
    }

    /// Encode as an `Upload-Metadata` header value
    pub fn to_header(&self) -> String {
        self.0
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.clone()
                } else {
                    format!("{} {}", key, STANDARD.encode(value))
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Metadata keys a mount requires or accepts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSchema {
    /// Key that selects the storage namespace; always required when set
    #[serde(default)]
    pub routing_key: Option<String>,

    /// Keys that must be present with a non-empty value
    #[serde(default)]
    pub required: Vec<String>,

    /// Keys accepted in addition to the required ones
    #[serde(default)]
    pub optional: Vec<String>,

    /// Accept keys not listed above
    #[serde(default)]
    pub allow_unknown: bool,
}

impl MetadataSchema {
    /// Accepts any metadata
    pub fn permissive() -> Self {
        Self {
            allow_unknown: true,
            ..Self::default()
        }
    }

    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn with_required(mut self, key: impl Into<String>) -> Self {
        self.required.push(key.into());
        self
    }

    pub fn with_optional(mut self, key: impl Into<String>) -> Self {
        self.optional.push(key.into());
        self
    }

    pub fn strict(mut self) -> Self {
        self.allow_unknown = false;
        self
    }

    /// Check `metadata` against this schema
    pub fn validate(&self, metadata: &Metadata) -> Result<(), ValidationError> {
        if let Some(routing_key) = &self.routing_key {
            if metadata.get(routing_key).map_or(true, str::is_empty) {
                return Err(ValidationError::MissingRoutingKey(routing_key.clone()));
            }
        }

        for key in &self.required {
            if metadata.get(key).map_or(true, str::is_empty) {
                return Err(ValidationError::MissingMetadata(key.clone()));
            }
        }

        if !self.allow_unknown {
            let known = |key: &str| {
                self.routing_key.as_deref() == Some(key)
                    || self.required.iter().any(|k| k == key)
                    || self.optional.iter().any(|k| k == key)
            };
            if let Some(unknown) = metadata.keys().find(|key| !known(key)) {
                return Err(ValidationError::UnknownMetadata(unknown.to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        // propertyId=p1, filename=photo.jpg, is_confidential (no value)
        let metadata =
            Metadata::parse_header("propertyId cDE=, filename cGhvdG8uanBn,is_confidential")
                .unwrap();

        assert_eq!(metadata.get("propertyId"), Some("p1"));
        assert_eq!(metadata.get("filename"), Some("photo.jpg"));
        assert_eq!(metadata.get("is_confidential"), Some(""));
        assert_eq!(metadata.get("missing"), None);
    }

    #[test]
    fn test_header_encoding() {
        let metadata: Metadata = [("propertyId", "p1"), ("flag", "")].into_iter().collect();
        assert_eq!(metadata.to_header(), "flag,propertyId cDE=");
        assert_eq!(Metadata::parse_header(&metadata.to_header()).unwrap(), metadata);
        assert_eq!(Metadata::parse_header("").unwrap(), Metadata::new());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            Metadata::parse_header("name !!notbase64"),
            Err(ValidationError::MalformedMetadata(_))
        ));
        assert!(matches!(
            Metadata::parse_header("name cDE=,name cDI="),
            Err(ValidationError::MalformedMetadata(_))
        ));
    }

    #[test]
    fn test_schema_routing_key() {
        let schema = MetadataSchema::permissive().with_routing_key("propertyId");

        let missing: Metadata = [("filename", "a.jpg")].into_iter().collect();
        assert_eq!(
            schema.validate(&missing),
            Err(ValidationError::MissingRoutingKey("propertyId".to_string()))
        );

        let empty: Metadata = [("propertyId", "")].into_iter().collect();
        assert!(schema.validate(&empty).is_err());

        let present: Metadata = [("propertyId", "p1"), ("extra", "x")].into_iter().collect();
        assert_eq!(schema.validate(&present), Ok(()));
    }

    #[test]
    fn test_schema_strict() {
        let schema = MetadataSchema::default()
            .with_required("filename")
            .with_optional("filetype")
            .strict();

        let ok: Metadata = [("filename", "a"), ("filetype", "image/png")]
            .into_iter()
            .collect();
        assert_eq!(schema.validate(&ok), Ok(()));

        let unknown: Metadata = [("filename", "a"), ("owner", "b")].into_iter().collect();
        assert_eq!(
            schema.validate(&unknown),
            Err(ValidationError::UnknownMetadata("owner".to_string()))
        );

        assert_eq!(
            schema.validate(&Metadata::new()),
            Err(ValidationError::MissingMetadata("filename".to_string()))
        );
    }
}

//! Ingestion adapter interface.
//!
//! Adapters turn raw acquisition sources into typed entities. The core does
//! not parse file formats itself; [`Pipeline::ingest`](crate::Pipeline::ingest)
//! stores whatever an adapter produces.

use serde::Deserialize;

use crate::schema::{Entity, EntityKey, Fields};
use crate::{Error, Result};

/// Produces entities from an external source.
pub trait IngestionAdapter {
    /// What the adapter reads (a path, a buffer, a URL...).
    type Source: ?Sized;

    /// Read the source into `(entity type, entity)` pairs.
    ///
    /// Entities are expected to be valid for their type already; they are
    /// stored without field validation.
    ///
    /// # Errors
    ///
    /// Returns error if the source cannot be read or parsed.
    fn produce_entities(&self, source: &Self::Source) -> Result<Vec<(String, Entity)>>;
}

/// Counts from one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Newly stored entities
    pub inserted: usize,
    /// Entities already stored with an identical payload
    pub unchanged: usize,
}

impl IngestReport {
    /// Total entities the adapter produced.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.inserted + self.unchanged
    }
}

#[derive(Debug, Deserialize)]
struct JsonEntity {
    entity_type: String,
    key: EntityKey,
    #[serde(default)]
    fields: Fields,
}

/// Adapter reading a JSON array of `{entity_type, key, fields}` objects.
///
/// ```rust
/// use spyglass_core::ingest::{IngestionAdapter, JsonAdapter};
///
/// # fn main() -> spyglass_core::Result<()> {
/// let source = r#"[{"entity_type": "Session", "key": {"subject": "A"}}]"#;
/// let entities = JsonAdapter.produce_entities(source)?;
/// assert_eq!(entities[0].0, "Session");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonAdapter;

impl IngestionAdapter for JsonAdapter {
    type Source = str;

    fn produce_entities(&self, source: &str) -> Result<Vec<(String, Entity)>> {
        let rows: Vec<JsonEntity> = serde_json::from_str(source)?;
        rows.into_iter()
            .map(|row| {
                if row.key.is_empty() {
                    return Err(Error::validation(&row.entity_type, "ingested entity has an empty key"));
                }
                let entity = Entity::builder(&row.entity_type)
                    .with_key(row.key)
                    .fields(row.fields)
                    .build();
                Ok((row.entity_type, entity))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_adapter_reads_keys_and_fields() {
        let source = r#"[
            {"entity_type": "Recording", "key": {"subject": "A", "epoch": 2}, "fields": {"rate": 30000.0}},
            {"entity_type": "Session", "key": {"subject": "A"}}
        ]"#;
        let entities = JsonAdapter.produce_entities(source).unwrap();
        assert_eq!(entities.len(), 2);

        let (ty, rec) = &entities[0];
        assert_eq!(ty, "Recording");
        assert_eq!(rec.key().get("epoch"), Some(&crate::schema::KeyValue::Int(2)));
        assert_eq!(rec.field("rate"), Some(&serde_json::json!(30000.0)));
        assert!(entities[1].1.fields().is_empty());
    }

    #[test]
    fn test_json_adapter_rejects_empty_key() {
        let source = r#"[{"entity_type": "Session", "key": {}}]"#;
        assert!(matches!(
            JsonAdapter.produce_entities(source),
            Err(Error::ValidationError { .. })
        ));
    }

    #[test]
    fn test_json_adapter_malformed_source() {
        assert!(matches!(
            JsonAdapter.produce_entities("not json"),
            Err(Error::Serialization(_))
        ));
    }
}

//! Entity Schema Layer tests through the pipeline surface.

use serde_json::json;
use spyglass_core::schema::{Entity, EntityKey, FieldSpec, FieldType, InsertOutcome};
use spyglass_core::{Error, Pipeline};

fn pipeline() -> Pipeline {
    let pipeline = Pipeline::new().unwrap();
    pipeline
        .define_entity_type(
            "Session",
            vec![
                FieldSpec::required("subject", FieldType::String),
                FieldSpec::required("session", FieldType::Integer),
            ],
            vec![
                FieldSpec::required("experimenter", FieldType::String),
                FieldSpec::optional("notes", FieldType::String),
            ],
        )
        .unwrap();
    pipeline
}

fn session(n: i64, experimenter: &str) -> Entity {
    Entity::builder("Session")
        .key("subject", "mouse-7")
        .key("session", n)
        .field("experimenter", experimenter)
        .build()
}

// =============================================================================
// Insert / get
// =============================================================================

#[test]
fn test_insert_then_get_round_trip() {
    let pipeline = pipeline();
    let s = session(1, "ana");
    assert_eq!(pipeline.insert(s.clone()).unwrap(), InsertOutcome::Inserted);
    assert_eq!(pipeline.get("Session", s.key()).unwrap(), s);
}

#[test]
fn test_reinsert_identical_is_idempotent() {
    let pipeline = pipeline();
    pipeline.insert(session(1, "ana")).unwrap();
    assert_eq!(
        pipeline.insert(session(1, "ana")).unwrap(),
        InsertOutcome::Unchanged
    );
    assert_eq!(pipeline.entities("Session").unwrap().len(), 1);
}

#[test]
fn test_insert_different_payload_is_duplicate() {
    let pipeline = pipeline();
    pipeline.insert(session(1, "ana")).unwrap();
    match pipeline.insert(session(1, "ben")) {
        Err(Error::DuplicateKey { entity_type, key }) => {
            assert_eq!(entity_type, "Session");
            assert_eq!(key.get("session"), Some(&1i64.into()));
        }
        other => panic!("expected DuplicateKey, got {other:?}"),
    }
}

#[test]
fn test_missing_required_field() {
    let pipeline = pipeline();
    let incomplete = Entity::builder("Session")
        .key("subject", "mouse-7")
        .key("session", 1i64)
        .build();
    assert!(matches!(
        pipeline.insert(incomplete),
        Err(Error::ValidationError { .. })
    ));
}

#[test]
fn test_wrong_key_type() {
    let pipeline = pipeline();
    let bad = Entity::builder("Session")
        .key("subject", "mouse-7")
        .key("session", "one")
        .field("experimenter", "ana")
        .build();
    assert!(matches!(pipeline.insert(bad), Err(Error::ValidationError { .. })));
}

#[test]
fn test_get_missing_is_not_found() {
    let pipeline = pipeline();
    let key = EntityKey::new().with("subject", "mouse-7").with("session", 9i64);
    assert!(matches!(
        pipeline.get("Session", &key),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn test_undefined_type() {
    let pipeline = pipeline();
    let e = Entity::builder("Probe").key("id", 1i64).build();
    assert!(matches!(
        pipeline.insert(e),
        Err(Error::UnknownEntityType(name)) if name == "Probe"
    ));
}

// =============================================================================
// Definitions
// =============================================================================

#[test]
fn test_redefinition_with_other_key_conflicts() {
    let pipeline = pipeline();
    let err = pipeline
        .define_entity_type(
            "Session",
            vec![FieldSpec::required("subject", FieldType::String)],
            vec![],
        )
        .unwrap_err();
    assert!(matches!(err, Error::SchemaConflict { .. }));
}

#[test]
fn test_derived_type_key_shape() {
    let pipeline = pipeline();
    let ty = pipeline
        .define_derived_type("Position", &["Session"], "tracking", vec![])
        .unwrap();
    assert_eq!(
        ty.key_names().collect::<Vec<_>>(),
        vec!["subject", "session", "tracking_params"]
    );
}

#[test]
fn test_derived_type_rejects_disagreeing_inputs() {
    let pipeline = pipeline();
    pipeline
        .define_entity_type(
            "Probe",
            vec![FieldSpec::required("session", FieldType::String)],
            vec![],
        )
        .unwrap();
    assert!(matches!(
        pipeline.define_derived_type("Sorting", &["Session", "Probe"], "sorter", vec![]),
        Err(Error::SchemaConflict { .. })
    ));
}

// =============================================================================
// Revisions and parameter sets
// =============================================================================

#[test]
fn test_revise_creates_new_revision() {
    let pipeline = pipeline();
    let original = session(1, "ana");
    pipeline.insert(original.clone()).unwrap();

    let revised = pipeline.revise(session(1, "ben")).unwrap();
    assert_eq!(revised.revision(), 1);
    assert_eq!(revised.key(), original.key());
    assert_eq!(
        pipeline.get("Session", original.key()).unwrap().field("experimenter"),
        Some(&json!("ben"))
    );
}

#[test]
fn test_parameter_set_versions_are_immutable() {
    let pipeline = pipeline();
    let v1 = pipeline
        .register_parameter_set("sorter", "ms4", json!({"threshold": 4}))
        .unwrap();
    let v2 = pipeline
        .register_parameter_set("sorter", "ms4", json!({"threshold": 5}))
        .unwrap();

    assert_eq!((v1.version(), v2.version()), (1, 2));
    assert_eq!(pipeline.parameter_set("sorter", "ms4", Some(1)).unwrap(), v1);
    assert_eq!(pipeline.parameter_set("sorter", "ms4", None).unwrap(), v2);
    assert_ne!(v1.fingerprint().unwrap(), v2.fingerprint().unwrap());
    assert!(matches!(
        pipeline.parameter_set("sorter", "ms4", Some(3)),
        Err(Error::NotFound { .. })
    ));
}

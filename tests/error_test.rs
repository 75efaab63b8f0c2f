//! Tests for error types

use spyglass_core::schema::EntityKey;
use spyglass_core::Error;

#[test]
fn test_schema_conflict_error() {
    let error = Error::SchemaConflict {
        name: "Session".to_string(),
        reason: "different key".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Schema conflict on 'Session'"));
    assert!(error_str.contains("different key"));
}

#[test]
fn test_duplicate_key_error() {
    let error = Error::DuplicateKey {
        entity_type: "Session".to_string(),
        key: EntityKey::new().with("subject", "A").with("session", 2i64),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Duplicate key in 'Session'"));
    assert!(error_str.contains("subject=A"));
    assert!(error_str.contains("revise()"));
}

#[test]
fn test_cycle_detected_error() {
    let error = Error::CycleDetected {
        path: vec!["A".to_string(), "B".to_string(), "A".to_string()],
    };
    assert_eq!(
        format!("{error}"),
        "Cycle detected in derivation graph: A -> B -> A"
    );
}

#[test]
fn test_computation_failed_error() {
    let error = Error::ComputationFailed {
        node: "Ripples".to_string(),
        key: EntityKey::new().with("subject", "A"),
        reason: "detector crashed".to_string(),
        blocked: vec!["Events".to_string(), "Summary".to_string()],
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Computation failed at node 'Ripples'"));
    assert!(error_str.contains("detector crashed"));
    assert!(error_str.contains("Blocked downstream nodes: Events, Summary"));
    assert!(error.is_computation_failure());
}

#[test]
fn test_computation_failed_without_blocked() {
    let error = Error::ComputationFailed {
        node: "LFP".to_string(),
        key: EntityKey::new(),
        reason: "boom".to_string(),
        blocked: vec![],
    };
    assert!(!format!("{error}").contains("Blocked"));
}

#[test]
fn test_unsatisfied_dependency_error() {
    let error = Error::UnsatisfiedDependency {
        entity_type: "Recording".to_string(),
        detail: "no entity with key {subject=Z}".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Unsatisfied dependency on 'Recording'"));
    assert!(!error.is_computation_failure());
}

#[test]
fn test_unknown_entity_type_error() {
    let error = Error::UnknownEntityType("Probe".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Unknown entity type 'Probe'"));
    assert!(error_str.contains("define_entity_type()"));
}

#[test]
fn test_cancelled_error() {
    let error = Error::Cancelled {
        node: "LFP".to_string(),
    };
    assert!(format!("{error}").contains("cancelled before node 'LFP'"));
}

#[test]
fn test_from_serde_error() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let error: Error = json_err.into();
    assert!(matches!(error, Error::Serialization(_)));
}

#[test]
fn test_from_io_error() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let error: Error = io_err.into();
    assert!(format!("{error}").contains("IO error"));
}

#[test]
fn test_error_debug() {
    let error = Error::UnknownDerivation("Theta".to_string());
    let debug_str = format!("{error:?}");
    assert!(debug_str.contains("UnknownDerivation"));
}

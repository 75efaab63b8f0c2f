//! Node registration and plan resolution through the pipeline surface.

mod common;

use common::{fields, request, root_key, Fixture};
use serde_json::json;
use spyglass_core::registry::{compute_fn, Registry};
use spyglass_core::resolver::Request;
use spyglass_core::schema::{FieldSpec, FieldType};
use spyglass_core::Error;

#[test]
fn test_nodes_listed_in_declaration_order() {
    let fx = Fixture::new();
    assert_eq!(
        fx.pipeline.node_names(),
        vec!["LFP", "Ripples", "Theta", "Events"]
    );
    let events = fx.pipeline.resolve_node("Events").unwrap();
    assert_eq!(events.input_types(), ["Theta".to_string(), "Ripples".to_string()]);
    assert_eq!(events.parameter_type(), "events");
}

#[test]
fn test_unknown_derivation() {
    let fx = Fixture::new();
    assert!(matches!(
        fx.pipeline.resolve_node("Recording"),
        Err(Error::UnknownDerivation(_))
    ));
    fx.add_recording("A", 30000.0);
    assert!(matches!(
        fx.pipeline.request(&request("Recording", "A")),
        Err(Error::UnknownDerivation(_))
    ));
}

#[test]
fn test_cycle_rejected_through_pipeline() {
    let pipeline = spyglass_core::Pipeline::new().unwrap();
    for name in ["X", "Y"] {
        pipeline
            .define_entity_type(
                name,
                vec![
                    FieldSpec::required("id", FieldType::Integer),
                    FieldSpec::required("p_params", FieldType::String),
                ],
                vec![],
            )
            .unwrap();
    }
    pipeline
        .register_node("X", &["Y"], "p", |_ctx| Ok(fields(&[])))
        .unwrap();
    match pipeline.register_node("Y", &["X"], "p", |_ctx| Ok(fields(&[]))) {
        Err(Error::CycleDetected { path }) => assert_eq!(path, vec!["Y", "X", "Y"]),
        other => panic!("expected CycleDetected, got {other:?}"),
    }
    assert_eq!(pipeline.node_names(), vec!["X"]);
}

#[test]
fn test_cycle_detected_names_path() {
    let mut registry = Registry::new();
    let noop = || compute_fn(|_ctx| Ok(fields(&[])));
    registry.register_node("B", &["A"], "p", noop()).unwrap();
    registry.register_node("C", &["B"], "p", noop()).unwrap();

    match registry.register_node("A", &["C"], "p", noop()) {
        Err(Error::CycleDetected { path }) => assert_eq!(path, vec!["A", "C", "B", "A"]),
        other => panic!("expected CycleDetected, got {other:?}"),
    }
    let message = registry
        .register_node("A", &["C"], "p", noop())
        .unwrap_err()
        .to_string();
    assert!(message.contains("A -> C -> B -> A"));
}

#[test]
fn test_output_key_shape_enforced() {
    let fx = Fixture::new();
    fx.pipeline
        .define_entity_type(
            "Spectrum",
            vec![FieldSpec::required("subject", FieldType::String)],
            vec![],
        )
        .unwrap();
    let err = fx
        .pipeline
        .register_node("Spectrum", &["LFP"], "spectral", |_ctx| Ok(fields(&[])))
        .unwrap_err();
    assert!(matches!(err, Error::SchemaConflict { .. }));
}

#[test]
fn test_register_requires_defined_types() {
    let fx = Fixture::new();
    let err = fx
        .pipeline
        .register_node("Undefined", &["LFP"], "p", |_ctx| Ok(fields(&[])))
        .unwrap_err();
    assert!(matches!(err, Error::UnknownEntityType(_)));
}

#[test]
fn test_unregister_leaf_node() {
    let fx = Fixture::new();
    assert!(matches!(
        fx.pipeline.unregister_node("LFP"),
        Err(Error::SchemaConflict { .. })
    ));
    fx.pipeline.unregister_node("Events").unwrap();
    assert_eq!(fx.pipeline.node_names(), vec!["LFP", "Ripples", "Theta"]);
}

#[test]
fn test_plan_is_deterministic() {
    let fx = Fixture::new();
    fx.add_recording("A", 30000.0);
    let a = fx.pipeline.plan(&request("Events", "A")).unwrap();
    let b = fx.pipeline.plan(&request("Events", "A")).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.node_order(), vec!["LFP", "Ripples", "Theta", "Events"]);
    assert_eq!(a.roots(), [("Recording".to_string(), root_key("A"))]);
}

#[test]
fn test_plan_requires_root_entity() {
    let fx = Fixture::new();
    match fx.pipeline.plan(&request("Events", "Z")) {
        Err(Error::UnsatisfiedDependency { entity_type, .. }) => assert_eq!(entity_type, "Recording"),
        other => panic!("expected UnsatisfiedDependency, got {other:?}"),
    }
}

#[test]
fn test_plan_requires_parameter_selection_without_default() {
    let fx = Fixture::new();
    fx.add_recording("A", 30000.0);
    let bare = Request::new("LFP", root_key("A"));
    match fx.pipeline.plan(&bare) {
        Err(Error::UnsatisfiedDependency { entity_type, .. }) => assert_eq!(entity_type, "filter"),
        other => panic!("expected UnsatisfiedDependency, got {other:?}"),
    }
    fx.pipeline
        .insert_default_parameters("filter", json!({"cutoff": 250.0}))
        .unwrap();
    let lfp = fx.pipeline.request(&bare).unwrap();
    assert_eq!(lfp.field("cutoff"), Some(&json!(250.0)));
}

//! Persisted selections: which (root key, parameters) combinations to keep
//! computed, and re-running only the ones that are missing or out of date.

mod common;

use common::{request, root_key, Fixture};
use serde_json::json;
use spyglass_core::resolver::{ParameterRef, Request};
use spyglass_core::Error;

fn two_filters(fx: &Fixture) {
    fx.pipeline
        .register_parameter_set("filter", "lfp_300", json!({"cutoff": 300.0}))
        .unwrap();
}

fn lfp_300(subject: &str) -> Request {
    Request::new("LFP", root_key(subject)).with_parameters("lfp_300")
}

#[test]
fn test_select_stores_each_combination_once() {
    let fx = Fixture::new();
    two_filters(&fx);

    assert!(fx.pipeline.select(&request("LFP", "A")).unwrap());
    assert!(fx.pipeline.select(&lfp_300("A")).unwrap());
    assert!(!fx.pipeline.select(&request("LFP", "A")).unwrap());

    let stored = fx.pipeline.selections("LFP").unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.contains(&lfp_300("A")));
    assert!(fx.pipeline.selections("Events").unwrap().is_empty());
}

#[test]
fn test_select_validates_target_and_parameters() {
    let fx = Fixture::new();
    assert!(matches!(
        fx.pipeline.select(&Request::new("Spectrogram", root_key("A"))),
        Err(Error::UnknownDerivation(_))
    ));
    assert!(matches!(
        fx.pipeline.select(&Request::new("LFP", root_key("A")).with_parameters("lfp_9000")),
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        fx.pipeline
            .select(&Request::new("LFP", root_key("A")).with_parameter_version("lfp_400", 7)),
        Err(Error::NotFound { .. })
    ));
    assert!(fx.pipeline.selections("LFP").unwrap().is_empty());
}

#[test]
fn test_populate_selections_runs_only_pending() {
    let fx = Fixture::new();
    two_filters(&fx);
    fx.add_recording("A", 30000.0);
    fx.pipeline.select(&request("LFP", "A")).unwrap();
    fx.pipeline.select(&lfp_300("A")).unwrap();

    assert_eq!(fx.pipeline.pending_selections("LFP").unwrap().len(), 2);
    let report = fx.pipeline.populate_selections("LFP").unwrap();
    assert!(report.is_complete());
    assert_eq!(report.completed.len(), 2);
    assert_eq!(fx.calls.count("LFP"), 2);

    let cutoffs: Vec<f64> = fx
        .pipeline
        .entities("LFP")
        .unwrap()
        .iter()
        .filter_map(|e| e.field("cutoff").and_then(serde_json::Value::as_f64))
        .collect();
    assert_eq!(cutoffs.len(), 2);
    assert!(cutoffs.contains(&300.0) && cutoffs.contains(&400.0));

    // Everything current: nothing pending, nothing runs
    assert!(fx.pipeline.pending_selections("LFP").unwrap().is_empty());
    let again = fx.pipeline.populate_selections("LFP").unwrap();
    assert!(again.completed.is_empty());
    assert_eq!(fx.calls.count("LFP"), 2);
}

#[test]
fn test_revised_input_makes_selections_pending() {
    let fx = Fixture::new();
    two_filters(&fx);
    fx.add_recording("A", 30000.0);
    fx.add_recording("B", 30000.0);
    for subject in ["A", "B"] {
        fx.pipeline.select(&request("LFP", subject)).unwrap();
        fx.pipeline.select(&lfp_300(subject)).unwrap();
    }
    fx.pipeline.populate_selections("LFP").unwrap();
    assert_eq!(fx.calls.count("LFP"), 4);

    fx.pipeline.revise(common::recording("A", 15000.0)).unwrap();
    let pending = fx.pipeline.pending_selections("LFP").unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|r| r.root_key() == &root_key("A")));

    let report = fx.pipeline.populate_selections("LFP").unwrap();
    assert_eq!(report.completed.len(), 2);
    assert_eq!(fx.calls.count("LFP"), 6);
}

#[test]
fn test_downstream_selection_pending_when_upstream_stale() {
    let fx = Fixture::new();
    fx.add_recording("A", 30000.0);
    fx.pipeline.select(&request("Events", "A")).unwrap();
    fx.pipeline.populate_selections("Events").unwrap();
    assert!(fx.pipeline.pending_selections("Events").unwrap().is_empty());

    fx.pipeline.revise(common::recording("A", 15000.0)).unwrap();
    assert_eq!(fx.pipeline.pending_selections("Events").unwrap().len(), 1);
}

#[test]
fn test_failed_selection_is_reported_and_stays_pending() {
    let fx = Fixture::new();
    fx.add_recording("A", 30000.0);
    fx.pipeline.select(&request("Ripples", "A")).unwrap();
    // No recording for B yet: cannot be planned, so it is pending
    fx.pipeline.select(&request("Ripples", "B")).unwrap();
    fx.fail_ripples
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let report = fx.pipeline.populate_selections("Ripples").unwrap();
    assert_eq!(report.failed.len(), 2);
    let failed_keys: Vec<_> = report.failed.iter().map(|(r, _)| r.root_key().clone()).collect();
    assert!(failed_keys.contains(&root_key("A")));
    assert!(failed_keys.contains(&root_key("B")));
    assert_eq!(fx.pipeline.pending_selections("Ripples").unwrap().len(), 2);

    fx.fail_ripples
        .store(false, std::sync::atomic::Ordering::SeqCst);
    fx.add_recording("B", 30000.0);
    let report = fx.pipeline.populate_selections("Ripples").unwrap();
    assert!(report.is_complete());
    assert_eq!(report.completed.len(), 2);
}

#[test]
fn test_pinned_parameter_selection() {
    let fx = Fixture::new();
    fx.add_recording("A", 30000.0);
    fx.pipeline
        .register_parameter_set("filter", "lfp_400", json!({"cutoff": 350.0}))
        .unwrap();

    let pinned = Request::new("LFP", root_key("A")).with_parameter_version("lfp_400", 1);
    fx.pipeline.select(&pinned).unwrap();
    assert_eq!(
        fx.pipeline.selections("LFP").unwrap()[0].parameters(),
        &[ParameterRef::pinned("lfp_400", 1)]
    );
    let report = fx.pipeline.populate_selections("LFP").unwrap();
    assert_eq!(report.completed[0].key().get("filter_params"), Some(&"lfp_400@v1".into()));
}

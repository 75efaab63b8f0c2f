//! LFP Pipeline Example
//!
//! Builds a two-stage analysis (Recording -> LFP -> Theta), ingests
//! recordings from JSON, requests derived results, and shows how caching
//! and staleness behave.
//!
//! Run with: cargo run --example lfp_pipeline

use anyhow::Context;
use serde_json::{json, Value};
use spyglass_core::ingest::JsonAdapter;
use spyglass_core::resolver::Request;
use spyglass_core::schema::{Entity, EntityKey, FieldSpec, FieldType, Fields};
use spyglass_core::{Pipeline, PipelineConfig};

const RECORDINGS: &str = r#"[
    {"entity_type": "Recording",
     "key": {"subject": "mouse-01", "date": "2024-03-11"},
     "fields": {"sampling_rate": 30000.0}},
    {"entity_type": "Recording",
     "key": {"subject": "mouse-02", "date": "2024-03-11"},
     "fields": {"sampling_rate": 20000.0}}
]"#;

fn number(entity: Option<&Entity>, field: &str) -> anyhow::Result<f64> {
    entity
        .and_then(|e| e.field(field))
        .and_then(Value::as_f64)
        .with_context(|| format!("input field '{field}' missing"))
}

fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::default();
    config.init_tracing()?;

    println!("=== spyglass LFP pipeline ===\n");

    // -------------------------------------------------------------------------
    // 1. Declare entity types and parameter sets
    // -------------------------------------------------------------------------
    println!("1. Defining schema...");

    let pipeline = Pipeline::builder().config(config).build()?;
    pipeline.define_entity_type(
        "Recording",
        vec![
            FieldSpec::required("subject", FieldType::String),
            FieldSpec::required("date", FieldType::String),
        ],
        vec![FieldSpec::required("sampling_rate", FieldType::Float)],
    )?;
    pipeline.define_derived_type(
        "LFP",
        &["Recording"],
        "filter",
        vec![FieldSpec::required("rate", FieldType::Float)],
    )?;
    pipeline.define_derived_type(
        "Theta",
        &["LFP"],
        "theta",
        vec![FieldSpec::required("power", FieldType::Float)],
    )?;

    let filter = pipeline.register_parameter_set("filter", "lfp_400", json!({"decimation": 30.0}))?;
    pipeline.insert_default_parameters("theta", json!({"band": [6, 10]}))?;
    println!("   Types: {:?}", pipeline.schema().entity_type_names());
    println!("   Filter parameters: {}", filter.reference());

    // -------------------------------------------------------------------------
    // 2. Register computation nodes
    // -------------------------------------------------------------------------
    println!("\n2. Registering nodes...");

    pipeline.register_node("LFP", &["Recording"], "filter", |ctx| {
        let rate = number(ctx.input("Recording"), "sampling_rate")?;
        let decimation = ctx
            .parameters
            .get("decimation")
            .and_then(Value::as_f64)
            .context("filter parameters lack decimation")?;
        Ok(Fields::from([("rate".to_string(), json!(rate / decimation))]))
    })?;
    pipeline.register_node("Theta", &["LFP"], "theta", |ctx| {
        let rate = number(ctx.input("LFP"), "rate")?;
        Ok(Fields::from([("power".to_string(), json!(rate * 0.5))]))
    })?;
    println!("   Nodes: {:?}", pipeline.node_names());

    // -------------------------------------------------------------------------
    // 3. Ingest raw recordings
    // -------------------------------------------------------------------------
    println!("\n3. Ingesting recordings...");

    let report = pipeline.ingest(&JsonAdapter, RECORDINGS)?;
    println!("   Inserted: {}, unchanged: {}", report.inserted, report.unchanged);

    // -------------------------------------------------------------------------
    // 4. Request a derived result
    // -------------------------------------------------------------------------
    println!("\n4. Requesting Theta for mouse-01...");

    let root = EntityKey::new()
        .with("subject", "mouse-01")
        .with("date", "2024-03-11");
    let request = Request::new("Theta", root).with_parameters("lfp_400");

    for step in pipeline.plan(&request)?.steps() {
        println!("   Plan step: {} -> {}", step.node(), step.output_key());
    }
    let first = pipeline.execute(&request, None)?;
    println!(
        "   First run: {} computed, {} cached",
        first.computed_count(),
        first.cached_count()
    );
    let second = pipeline.execute(&request, None)?;
    println!(
        "   Second run: {} computed, {} cached",
        second.computed_count(),
        second.cached_count()
    );
    println!("   Theta power: {:?}", second.output().field("power"));

    // -------------------------------------------------------------------------
    // 5. Revise an input and recompute
    // -------------------------------------------------------------------------
    println!("\n5. Correcting the sampling rate...");

    pipeline.revise(
        Entity::builder("Recording")
            .key("subject", "mouse-01")
            .key("date", "2024-03-11")
            .field("sampling_rate", 32000.0)
            .build(),
    )?;
    let theta_key = second.output().key().clone();
    println!("   Theta stale before rerun: {}", pipeline.is_stale("Theta", &theta_key)?);
    let third = pipeline.execute(&request, None)?;
    println!("   Recomputed steps: {}", third.computed_count());
    println!("   Theta power: {:?}", third.output().field("power"));
    println!("   Theta stale after rerun: {}", pipeline.is_stale("Theta", &theta_key)?);

    // -------------------------------------------------------------------------
    // 6. Populate every recording and inspect history
    // -------------------------------------------------------------------------
    println!("\n6. Populating all recordings...");

    let populated = pipeline.populate(&Request::new("Theta", EntityKey::new()).with_parameters("lfp_400"))?;
    println!(
        "   Completed: {}, failed: {}",
        populated.completed.len(),
        populated.failed.len()
    );

    for summary in pipeline.list_computations("LFP")? {
        let rate = pipeline
            .fetch_output(&summary)
            .ok()
            .and_then(|e| e.field("rate").cloned());
        println!(
            "   LFP {} attempt {} {:?} rate {:?}{}",
            summary.output_key,
            summary.attempt,
            summary.status,
            rate,
            if summary.is_superseded() { " (superseded)" } else { "" }
        );
    }

    // -------------------------------------------------------------------------
    // 7. Keep two filter settings computed through selections
    // -------------------------------------------------------------------------
    println!("\n7. Selecting a second filter setting...");

    pipeline.register_parameter_set("filter", "lfp_1000", json!({"decimation": 12.0}))?;
    for root in pipeline.entities("Recording")? {
        for filter in ["lfp_400", "lfp_1000"] {
            pipeline.select(&Request::new("LFP", root.key().clone()).with_parameters(filter))?;
        }
    }
    println!("   Pending: {}", pipeline.pending_selections("LFP")?.len());
    let selected = pipeline.populate_selections("LFP")?;
    println!(
        "   Completed: {}, failed: {}, still pending: {}",
        selected.completed.len(),
        selected.failed.len(),
        pipeline.pending_selections("LFP")?.len()
    );
    println!("   Pruned superseded records: {}", pipeline.prune_superseded()?);

    println!("\n=== Done ===");
    Ok(())
}

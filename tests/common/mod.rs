//! Shared fixture: a small LFP analysis pipeline.
//!
//! ```text
//! Recording ──> LFP ──> Ripples ──┐
//!                  └──> Theta ────┴──> Events
//! ```

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use serde_json::{json, Value};
use spyglass_core::resolver::Request;
use spyglass_core::schema::{Entity, EntityKey, FieldSpec, FieldType, Fields};
use spyglass_core::store::{MemoryStore, Store};
use spyglass_core::{Pipeline, PipelineConfig};

/// Counts compute function invocations per node.
#[derive(Debug, Default)]
pub struct Calls(Mutex<BTreeMap<String, usize>>);

impl Calls {
    pub fn hit(&self, node: &str) {
        *self.0.lock().unwrap().entry(node.to_string()).or_default() += 1;
    }

    pub fn count(&self, node: &str) -> usize {
        self.0.lock().unwrap().get(node).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.lock().unwrap().values().sum()
    }
}

pub struct Fixture {
    pub pipeline: Pipeline,
    pub calls: Arc<Calls>,
    /// While set, the Ripples node fails.
    pub fail_ripples: Arc<AtomicBool>,
}

fn number(entity: Option<&Entity>, field: &str) -> anyhow::Result<f64> {
    entity
        .and_then(|e| e.field(field))
        .and_then(Value::as_f64)
        .with_context(|| format!("input field '{field}' missing"))
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn Store>) -> Self {
        let pipeline = Pipeline::builder()
            .store(store)
            .config(PipelineConfig::default())
            .build()
            .unwrap();
        let calls = Arc::new(Calls::default());
        let fail_ripples = Arc::new(AtomicBool::new(false));

        pipeline
            .define_entity_type(
                "Recording",
                vec![
                    FieldSpec::required("subject", FieldType::String),
                    FieldSpec::required("date", FieldType::String),
                ],
                vec![FieldSpec::required("sampling_rate", FieldType::Float)],
            )
            .unwrap();
        pipeline
            .define_derived_type(
                "LFP",
                &["Recording"],
                "filter",
                vec![
                    FieldSpec::required("cutoff", FieldType::Float),
                    FieldSpec::required("rate", FieldType::Float),
                ],
            )
            .unwrap();
        pipeline
            .define_derived_type(
                "Ripples",
                &["LFP"],
                "ripple",
                vec![FieldSpec::required("count", FieldType::Integer)],
            )
            .unwrap();
        pipeline
            .define_derived_type(
                "Theta",
                &["LFP"],
                "theta",
                vec![FieldSpec::required("power", FieldType::Float)],
            )
            .unwrap();
        pipeline
            .define_derived_type(
                "Events",
                &["Theta", "Ripples"],
                "events",
                vec![FieldSpec::required("total", FieldType::Float)],
            )
            .unwrap();

        pipeline
            .register_parameter_set("filter", "lfp_400", json!({"cutoff": 400.0}))
            .unwrap();
        pipeline
            .insert_default_parameters("ripple", json!({"threshold": 2.5}))
            .unwrap();
        pipeline
            .insert_default_parameters("theta", json!({"band": [6, 10]}))
            .unwrap();
        pipeline
            .insert_default_parameters("events", json!({}))
            .unwrap();

        let c = Arc::clone(&calls);
        pipeline
            .register_node("LFP", &["Recording"], "filter", move |ctx| {
                c.hit("LFP");
                let rate = number(ctx.input("Recording"), "sampling_rate")?;
                let cutoff = ctx
                    .parameters
                    .get("cutoff")
                    .and_then(Value::as_f64)
                    .context("filter parameters lack cutoff")?;
                Ok(fields(&[("cutoff", json!(cutoff)), ("rate", json!(rate / 30.0))]))
            })
            .unwrap();

        let c = Arc::clone(&calls);
        let fail = Arc::clone(&fail_ripples);
        pipeline
            .register_node("Ripples", &["LFP"], "ripple", move |ctx| {
                c.hit("Ripples");
                if fail.load(Ordering::SeqCst) {
                    bail!("ripple detector crashed");
                }
                number(ctx.input("LFP"), "rate")?;
                Ok(fields(&[("count", json!(3))]))
            })
            .unwrap();

        let c = Arc::clone(&calls);
        pipeline
            .register_node("Theta", &["LFP"], "theta", move |ctx| {
                c.hit("Theta");
                let rate = number(ctx.input("LFP"), "rate")?;
                Ok(fields(&[("power", json!(rate * 0.5))]))
            })
            .unwrap();

        let c = Arc::clone(&calls);
        pipeline
            .register_node("Events", &["Theta", "Ripples"], "events", move |ctx| {
                c.hit("Events");
                let power = number(ctx.input("Theta"), "power")?;
                let count = number(ctx.input("Ripples"), "count")?;
                Ok(fields(&[("total", json!(power + count))]))
            })
            .unwrap();

        Self {
            pipeline,
            calls,
            fail_ripples,
        }
    }

    /// Insert one recording of subject `subject` on 2024-01-01.
    pub fn add_recording(&self, subject: &str, rate: f64) -> Entity {
        let rec = recording(subject, rate);
        self.pipeline.insert(rec.clone()).unwrap();
        rec
    }
}

pub fn recording(subject: &str, rate: f64) -> Entity {
    Entity::builder("Recording")
        .key("subject", subject)
        .key("date", "2024-01-01")
        .field("sampling_rate", rate)
        .build()
}

pub fn root_key(subject: &str) -> EntityKey {
    EntityKey::new()
        .with("subject", subject)
        .with("date", "2024-01-01")
}

pub fn request(target: &str, subject: &str) -> Request {
    Request::new(target, root_key(subject)).with_parameters("lfp_400")
}

pub fn fields(pairs: &[(&str, Value)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

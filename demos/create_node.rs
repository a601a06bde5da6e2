//! Walks a "create-node" process through suspension, resume and completion,
//! then runs a batch of port reservations on the worker pool.
//!
//! Run with `cargo run --example create_node`. Set `RUST_LOG=debug` to see
//! state changes per step.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use procflow::events::MemorySink;
use procflow::workflow::state::fields;
use procflow::workflow::{conditional, FieldKind, InputSchema, Target};
use procflow::{logging, Engine, EngineConfig, Registry, Step, WorkerPool, WorkflowDefinition};

fn build_registry() -> Result<Registry, procflow::workflow::RegistryError> {
    let mut registry = Registry::new();

    registry.register_step(Step::action("Allocate IP", |_, s| {
        Ok(s.clone().with("ip", "10.0.0.17"))
    }))?;
    registry.register_step(Step::retryable("Configure node", |ctx, s| {
        // Fails once to show the retry path
        if ctx.attempt == 1 {
            return Err("device busy".into());
        }
        Ok(s.clone().with("configured", true))
    }))?;
    registry.register_step(Step::input(
        "Confirm cabling",
        InputSchema::new()
            .required("cabled", FieldKind::Bool)
            .described("Confirm the node is patched in the rack"),
    ))?;
    registry.register_step(conditional(
        |s| s.get_bool("cabled") == Some(true),
        Step::action("Activate node", |_, s| Ok(s.clone().with("active", true))),
    ))?;
    registry.register_step(Step::action("Reserve port", |_, s| {
        let node = s.get_str("node_id").unwrap_or("unknown").to_string();
        Ok(s.clone().with("port", format!("{}:ge-0/0/1", node)))
    }))?;

    registry.register_workflow(
        WorkflowDefinition::new("create-node", Target::Create)
            .describe("Provision a new network node")
            .steps(["Allocate IP", "Configure node", "Confirm cabling", "Activate node"])
            .input(InputSchema::new().required("name", FieldKind::Text)),
    )?;
    registry.register_workflow(
        WorkflowDefinition::new("reserve-port", Target::Modify)
            .step("Reserve port")
            .input(InputSchema::new().required("node_id", FieldKind::Text))
            .target_field("node_id"),
    )?;

    Ok(registry)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init(false)?;

    let config = EngineConfig::load_or_default()?;
    let registry = Arc::new(build_registry()?);
    let sink = MemorySink::new();

    let mut engine = Engine::from_config(registry, &config)?;
    engine.set_sink(Arc::new(sink.clone()));
    engine.set_retry_policy(procflow::execution::RetryPolicy::immediate(3));
    let engine = Arc::new(engine);

    let id = engine.start("create-node", fields([("name", "edge-router-7".into())]))?;
    info!("Process {} is {}", id, engine.process(id)?.status);
    if let Some(schema) = engine.required_input(id)? {
        info!("Waiting for: {:?}", schema.field("cabled").map(|f| f.kind));
    }

    let status = engine.resume(id, fields([("cabled", true.into())]))?;
    info!("Process {} finished as {}", id, status);
    for record in engine.records(id)? {
        info!("  #{} {:<16} {:?}", record.seq, record.step, record.kind);
    }

    let pool = WorkerPool::new(Arc::clone(&engine), config.workers.threads);
    let nodes = ["node-1", "node-2", "node-3"];
    for node in nodes {
        engine.create("reserve-port", fields([("node_id", node.into())]))?;
    }
    pool.enqueue_runnable()?;

    for _ in nodes {
        match pool.recv_result(Duration::from_secs(5)) {
            Some(result) => match result.outcome {
                Ok(status) => info!("Process {} {}", result.process_id, status),
                Err(e) => error!("Process {} failed: {}", result.process_id, e),
            },
            None => error!("Timed out waiting for workers"),
        }
    }

    info!("{} events published", sink.events().len());
    Ok(())
}

//! Local simulator: runs a batch of jobs against in-memory collaborators
//! and prints the final counters as JSON.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};

use paygate_engine::config::env_var;
use paygate_engine::memory::{
    InMemoryPublisher, ScriptedJobExecutor, ScriptedPaymentChecker, SequentialInvoiceIssuer,
};
use paygate_engine::{
    Collaborators, EngineConfig, InMemoryJobRegistry, PollScheduler, Reconciler, RequestPayload,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match std::env::var("PAYGATE_LOG_FORMAT").as_deref() {
        Ok("pretty") => paygate_observability::init_pretty(),
        _ => paygate_observability::init(),
    }

    let config = EngineConfig::from_env().context("loading engine config")?;
    let jobs: u32 = env_var("PAYGATE_SIM_JOBS")?.unwrap_or(5);
    let settle_after: u32 = env_var("PAYGATE_SIM_SETTLE_AFTER")?.unwrap_or(4);
    let amount_units: u64 = env_var("PAYGATE_SIM_AMOUNT")?.unwrap_or(1_000);
    let deadline = config.job_timeout + config.global_tick_interval * 4;

    tracing::info!(jobs, settle_after, amount_units, ?config, "starting simulation");

    let publisher = Arc::new(InMemoryPublisher::new());
    let ports = Collaborators {
        invoices: Arc::new(SequentialInvoiceIssuer::new()),
        checker: Arc::new(ScriptedPaymentChecker::settling_after(settle_after)),
        executor: Arc::new(ScriptedJobExecutor::new()),
        feedback: publisher.clone(),
        results: publisher,
    };
    let registry = InMemoryJobRegistry::arc();
    let reconciler = Arc::new(Reconciler::new(config, registry.clone(), ports));

    for i in 0..jobs {
        reconciler
            .submit(RequestPayload::new(format!("simulated request #{i}")), amount_units)
            .await
            .with_context(|| format!("submitting job #{i}"))?;
    }

    let handle = PollScheduler::new(Arc::clone(&reconciler)).spawn();
    let settled = tokio::time::timeout(deadline, async {
        while reconciler.stats().terminal() < u64::from(jobs) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    handle.shutdown().await;

    let stats = reconciler.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if settled.is_err() {
        tracing::warn!(registry = ?registry.stats(), "simulation deadline passed");
        bail!(
            "{} of {jobs} jobs still open after {deadline:?}",
            u64::from(jobs) - stats.terminal()
        );
    }
    Ok(())
}

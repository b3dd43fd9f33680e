//! Command-line interface for tokenflow.
//!
//! Provides commands for inspecting configuration, fingerprinting payloads,
//! and simulating (possibly concurrent, possibly duplicate) submissions
//! through the orchestration pipeline.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use crate::config;
use crate::core::{
    Executor, InMemoryIdempotencyStore, OrchestrationPipeline, PreconditionChecker,
    RequestFingerprint, Validator,
};
use crate::domain::{
    OperationType, OrchestrationContext, OrchestrationResult, Rejection, ResponseEnvelope,
};

/// tokenflow - Idempotent workflow orchestration core
#[derive(Parser, Debug)]
#[command(name = "tokenflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show resolved configuration
    Config,

    /// Print the fingerprint of a JSON payload
    Fingerprint {
        /// Operation type the payload belongs to
        #[arg(short, long, default_value = OperationType::DEPLOY_ARC200)]
        operation: String,

        /// JSON payload
        payload: String,
    },

    /// Run submissions of one payload through an in-process pipeline
    Simulate {
        /// JSON payload
        payload: String,

        /// Operation type
        #[arg(short, long, default_value = OperationType::DEPLOY_ARC200)]
        operation: String,

        /// Idempotency key shared by all submissions
        #[arg(short, long)]
        key: Option<String>,

        /// Number of concurrent submissions
        #[arg(short = 'n', long, default_value = "1")]
        concurrency: usize,

        /// Initiator identity
        #[arg(long)]
        initiated_by: Option<String>,

        /// Asset names that already exist (precondition failures)
        #[arg(long, value_delimiter = ',')]
        existing: Vec<String>,

        /// Make the executor fail with this message
        #[arg(long)]
        fail_with: Option<String>,

        /// Executor latency in milliseconds
        #[arg(long, default_value = "50")]
        delay_ms: u64,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Config => show_config(),
            Commands::Fingerprint { operation, payload } => fingerprint(&operation, &payload),
            Commands::Simulate {
                payload,
                operation,
                key,
                concurrency,
                initiated_by,
                existing,
                fail_with,
                delay_ms,
            } => {
                let issuer = SimulatedIssuer {
                    operation: operation.clone(),
                    existing: existing.into_iter().collect(),
                    fail_with,
                    delay: Duration::from_millis(delay_ms),
                    invocations: AtomicUsize::new(0),
                };
                simulate(&payload, &operation, key, initiated_by, concurrency, issuer).await
            }
        }
    }
}

/// Stand-in for a token issuer: validates, checks existence, "deploys"
#[derive(Debug)]
pub struct SimulatedIssuer {
    operation: String,
    existing: HashSet<String>,
    fail_with: Option<String>,
    delay: Duration,
    invocations: AtomicUsize,
}

impl SimulatedIssuer {
    /// Executor invocations so far
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Validator<Value> for SimulatedIssuer {
    fn validate(&self, request: &Value) -> Result<(), Rejection> {
        let Some(object) = request.as_object() else {
            return Err(Rejection::new("payload must be a JSON object"));
        };
        match object.get("name").and_then(Value::as_str) {
            Some(name) if !name.trim().is_empty() => Ok(()),
            _ => Err(Rejection::new("name required")),
        }
    }
}

impl PreconditionChecker<Value> for SimulatedIssuer {
    async fn check(&self, request: &Value) -> Result<(), Rejection> {
        let name = request["name"].as_str().unwrap_or_default();
        if self.existing.contains(name) {
            return Err(Rejection::with_code(
                "ASSET_EXISTS",
                format!("asset '{}' already exists", name),
            ));
        }
        Ok(())
    }
}

impl Executor<Value, Value> for SimulatedIssuer {
    async fn execute(&self, request: Value) -> Result<Value> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        if let Some(ref message) = self.fail_with {
            anyhow::bail!("{}", message);
        }

        Ok(json!({
            "operation": self.operation,
            "asset": request["name"],
            "status": "created",
        }))
    }
}

fn parse_payload(payload: &str) -> Result<Value> {
    serde_json::from_str(payload).context("Payload is not valid JSON")
}

fn fingerprint(operation: &str, payload: &str) -> Result<()> {
    let value = parse_payload(payload)?;
    let fingerprint = RequestFingerprint::of(operation, &value)?;
    println!("{}", fingerprint);
    Ok(())
}

/// Submit the payload `concurrency` times and print every response envelope
async fn simulate(
    payload: &str,
    operation: &str,
    key: Option<String>,
    initiated_by: Option<String>,
    concurrency: usize,
    issuer: SimulatedIssuer,
) -> Result<()> {
    let cfg = config::config()?;
    let payload = parse_payload(payload)?;

    let store = Arc::new(InMemoryIdempotencyStore::new(cfg.idempotency.clone()));
    let purger = store.clone().spawn_purge_task();
    let pipeline = Arc::new(OrchestrationPipeline::with_settings(
        store,
        cfg.orchestration.clone(),
    )?);
    let issuer = Arc::new(issuer);

    let mut handles = Vec::with_capacity(concurrency);
    for _ in 0..concurrency.max(1) {
        let mut builder = OrchestrationContext::builder(operation);
        if let Some(ref key) = key {
            builder = builder.idempotency_key(key.clone());
        }
        if let Some(ref who) = initiated_by {
            builder = builder.initiated_by(who.clone());
        }
        let context = builder.build();

        let pipeline = pipeline.clone();
        let issuer = issuer.clone();
        let payload = payload.clone();
        handles.push(tokio::spawn(async move {
            let issuer = &*issuer;
            pipeline
                .execute(context, payload, issuer, issuer, issuer)
                .await
        }));
    }

    let mut envelopes: Vec<ResponseEnvelope<Value>> = Vec::with_capacity(handles.len());
    for handle in handles {
        let result: OrchestrationResult<Value> =
            handle.await.context("Submission task panicked")?;
        envelopes.push(result.to_envelope());
    }

    purger.abort();

    for envelope in &envelopes {
        println!("{}", serde_json::to_string(envelope)?);
    }
    eprintln!(
        "\n[{} submission(s), {} executor invocation(s)]",
        envelopes.len(),
        issuer.invocations()
    );

    let failed = envelopes.iter().filter(|e| !e.success).count();
    if failed > 0 {
        anyhow::bail!("{} of {} submission(s) failed", failed, envelopes.len());
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("tokenflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Idempotency:");
    println!("  Retention:       {}h", cfg.idempotency.retention_hours);
    println!("  Lease:           {}s", cfg.idempotency.lease_seconds);
    println!("  Purge interval:  {}s", cfg.idempotency.purge_interval_seconds);
    println!();
    println!("Orchestration:");
    println!("  Execution timeout: {}s", cfg.orchestration.execution_timeout_seconds);
    println!("  Wait timeout:      {}ms", cfg.orchestration.wait_timeout_ms);
    println!("  Key required for:");
    if cfg.orchestration.require_idempotency_key.is_empty() {
        println!("    (no operations)");
    } else {
        for pattern in &cfg.orchestration.require_idempotency_key {
            println!("    {}", pattern);
        }
    }

    Ok(())
}

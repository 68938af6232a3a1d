//! Run synthetic traffic through the engine over a mock link.

use anyhow::{Context, Result};
use linkwise_sync_client::{
    spawn_power_monitor, DeliveryOutcome, EventLog, KeyValueStore, ManualPowerSource,
    MemoryStore, MockTransport, ObserverRegistry, SqliteStore, SubmissionHandle, SyncConfig,
    SyncEvent, SyncOrchestrator,
};
use linkwise_sync_core::PowerScheduler;
use linkwise_sync_types::{
    EntityKey, EntityType, OptimizationLevel, PowerSignal, Priority, ThermalState,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Entity/priority pairs cycled through by the simulation.
const TRAFFIC_MIX: [(EntityType, Priority); 5] = [
    (EntityType::ActiveRound, Priority::Critical),
    (EntityType::Scorecard, Priority::High),
    (EntityType::Leaderboard, Priority::Normal),
    (EntityType::Heartbeat, Priority::Normal),
    (EntityType::HealthMetrics, Priority::Low),
];

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Operations to submit.
    pub ops: usize,
    /// Battery level in `[0, 1]`.
    pub battery: f32,
    /// Thermal state.
    pub thermal: ThermalState,
    /// OS low-power mode.
    pub low_power: bool,
    /// Fraction of first send attempts that fail.
    pub drop_rate: f64,
    /// Payload size per operation.
    pub payload_bytes: usize,
    /// How long to wait for outcomes.
    pub wait: Duration,
    /// SQLite file for the pending store; memory if unset.
    pub db: Option<PathBuf>,
}

/// What happened to the submitted operations.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Power level the drain loop honoured.
    pub level: OptimizationLevel,
    /// Operations submitted.
    pub submitted: usize,
    /// Operations acknowledged.
    pub acked: usize,
    /// Operations that failed terminally.
    pub failed: usize,
    /// Operations still outstanding when the wait ran out.
    pub held: usize,
    /// Envelopes handed to the link, retries included.
    pub sends: usize,
    /// Envelopes sent compressed.
    pub compressed: usize,
    /// Retries scheduled.
    pub retries: usize,
    /// Mean ack latency of acknowledged operations, in milliseconds.
    pub mean_latency_ms: Option<u64>,
    /// Per-operation outcome.
    pub operations: Vec<OperationReport>,
}

/// Outcome of one operation.
#[derive(Debug, Serialize)]
pub struct OperationReport {
    /// Operation id.
    pub id: String,
    /// `<type>:<id>` of the entity.
    pub entity: String,
    /// Delivery priority.
    pub priority: Priority,
    /// `acked`, `held`, or the failure message.
    pub outcome: String,
    /// Ack latency in milliseconds.
    pub latency_ms: Option<u64>,
}

/// Run the simulation and collect the report.
pub async fn simulate(config: SyncConfig, options: &SimulateOptions) -> Result<SimulationReport> {
    let observers = ObserverRegistry::new();
    let log = EventLog::new();
    observers.register(&log);

    let source = ManualPowerSource::new(PowerSignal::new(
        options.battery,
        options.thermal,
        options.low_power,
    ));
    let (power, monitor) = spawn_power_monitor(
        source,
        PowerScheduler::new(config.power.scheduler()),
        config.power.sample_interval(),
        observers.clone(),
    );

    let transport = MockTransport::new();
    let drops = (options.ops as f64 * options.drop_rate).round() as usize;
    for _ in 0..drops {
        transport.fail_next_send("simulated drop");
    }

    let store: Arc<dyn KeyValueStore> = match &options.db {
        Some(path) => Arc::new(
            SqliteStore::open(path)
                .await
                .with_context(|| format!("Failed to open pending store {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };

    let sync = SyncOrchestrator::start(
        config,
        Arc::new(transport.clone()),
        store,
        power,
        observers,
    )
    .await
    .context("Failed to start sync engine")?;

    tracing::info!(
        ops = options.ops,
        drops,
        level = %sync.power().level(),
        "Simulation started"
    );

    let mut submitted: Vec<(EntityKey, Priority, SubmissionHandle)> =
        Vec::with_capacity(options.ops);
    for i in 0..options.ops {
        let (entity_type, priority) = TRAFFIC_MIX[i % TRAFFIC_MIX.len()];
        let entity = EntityKey::new(entity_type, format!("sim-{i}"));
        let handle = sync
            .submit(entity.clone(), payload(i, options.payload_bytes), priority)
            .await?;
        submitted.push((entity, priority, handle));
    }

    let deadline = tokio::time::Instant::now() + options.wait;
    let mut operations = Vec::with_capacity(submitted.len());
    for (entity, priority, handle) in submitted {
        let id = handle.operation_id().to_string();
        let (outcome, latency_ms) =
            match tokio::time::timeout_at(deadline, handle.outcome()).await {
                Ok(Ok(DeliveryOutcome::Acked { latency, .. })) => {
                    ("acked".to_string(), Some(millis(latency)))
                }
                Ok(Err(e)) => (e.to_string(), None),
                Err(_) => ("held".to_string(), None),
            };
        operations.push(OperationReport {
            id,
            entity: entity.to_string(),
            priority,
            outcome,
            latency_ms,
        });
    }

    let status = sync.status().await?;
    sync.shutdown().await?;
    monitor.abort();

    let acked: Vec<u64> = operations.iter().filter_map(|op| op.latency_ms).collect();
    let held = operations.iter().filter(|op| op.outcome == "held").count();
    let envelopes = transport.sent_envelopes();

    Ok(SimulationReport {
        level: status.level,
        submitted: operations.len(),
        acked: acked.len(),
        failed: operations.len() - acked.len() - held,
        held,
        sends: envelopes.len(),
        compressed: envelopes.iter().filter(|e| e.compressed).count(),
        retries: log
            .events()
            .iter()
            .filter(|e| matches!(e, SyncEvent::Retrying { .. }))
            .count(),
        mean_latency_ms: (!acked.is_empty())
            .then(|| acked.iter().sum::<u64>() / acked.len() as u64),
        operations,
    })
}

/// Run the simulate command.
pub async fn run(config: SyncConfig, options: SimulateOptions, json: bool) -> Result<()> {
    let report = simulate(config, &options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("=== sync-sim simulate ===");
    println!();
    for op in &report.operations {
        match op.latency_ms {
            Some(latency) => println!(
                "  {:<8} {:<28} acked in {}ms",
                op.priority.to_string(),
                op.entity,
                latency
            ),
            None => println!(
                "  {:<8} {:<28} {}",
                op.priority.to_string(),
                op.entity,
                op.outcome
            ),
        }
    }
    println!();
    println!("Level:      {}", report.level);
    println!(
        "Operations: {} submitted, {} acked, {} failed, {} held",
        report.submitted, report.acked, report.failed, report.held
    );
    println!(
        "Link:       {} sends ({} compressed), {} retries",
        report.sends, report.compressed, report.retries
    );
    if let Some(latency) = report.mean_latency_ms {
        println!("Latency:    {latency}ms mean");
    }
    if report.held > 0 {
        match &options.db {
            Some(db) => println!(
                "\nHeld operations remain in {}; inspect with 'sync-sim pending --db {}'",
                db.display(),
                db.display()
            ),
            None => println!("\nHeld operations were discarded with the in-memory store."),
        }
    }

    Ok(())
}

/// Compressible payload unique to each operation.
fn payload(index: usize, len: usize) -> Vec<u8> {
    let mut bytes = format!("sim-{index};").into_bytes();
    bytes.extend((0..len).map(|i| b'a' + (i % 16) as u8));
    bytes.truncate(len.max(1));
    bytes
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

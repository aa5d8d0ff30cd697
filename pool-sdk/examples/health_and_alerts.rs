//! Health Monitoring and Alerts Example
//!
//! Registers an alert callback, inspects per-connection health reports,
//! and forces a maintenance sweep.
//!
//! Run with: cargo run --example health_and_alerts

use ftp_pool_sdk::{AlertThresholds, FtpPoolService, LogConfig, LogLevel, PoolSettings};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Health Monitoring and Alerts ===\n");

    // Step 1: Start with logging and tighter alert thresholds
    let settings = PoolSettings::new("localhost", 21)
        .with_credentials("demo", "demo")
        .with_capacity(2, 4)
        .with_log_config(LogConfig {
            level: LogLevel::Info,
            ..LogConfig::default()
        });

    let service = FtpPoolService::start(settings).await?;

    // Step 2: Register an alert callback
    service.set_alert_callback(Arc::new(|level, message, details| {
        println!(
            "   [ALERT {:?}] {} (failed ratio {:.0}%)",
            level,
            message,
            details.failed_ratio * 100.0
        );
    }));

    // Thresholds can be tightened at runtime.
    service.set_alert_thresholds(AlertThresholds {
        warning_consecutive_failures: 2,
        ..AlertThresholds::default()
    });

    // Step 3: Per-connection health report
    println!("1. Health report after warm-up:");
    for entry in service.health_report() {
        println!(
            "   connection {:3}  {:?}  last outcome: {}",
            entry.connection_id, entry.status, entry.last_outcome
        );
    }

    // Step 4: Force a maintenance sweep and read the counters
    println!("\n2. Forcing a maintenance sweep...");
    let repaired = service.run_maintenance_now().await;
    println!("   repaired {} connection(s)", repaired);

    let snapshot = service.metrics();
    println!("\n3. Health counters:");
    println!("   healthy:   {}", snapshot.health.counts.healthy);
    println!("   degraded:  {}", snapshot.health.counts.degraded);
    println!("   failed:    {}", snapshot.health.counts.failed);
    println!("   repaired:  {}", snapshot.health.repaired_connections);
    println!("   ka probes: {}", snapshot.health.keep_alive.probes_sent);

    service.shutdown().await;
    Ok(())
}

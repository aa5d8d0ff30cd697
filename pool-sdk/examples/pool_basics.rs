//! Connection Pool Basics Example
//!
//! Demonstrates pool configuration, warm-up, and concurrent borrow/return
//! cycles against a local FTP server.
//!
//! Run with: cargo run --example pool_basics

use ftp_pool_sdk::{FtpPoolService, PoolSettings, RetryPolicy};
use std::sync::Arc;
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== FTP Connection Pool Basics ===\n");

    // Step 1: Configure the pool
    println!("1. Configuring pool...");
    let settings = PoolSettings::new("localhost", 21)
        .with_credentials("demo", "demo")
        .with_capacity(2, 8)
        .with_max_wait(2_000)
        .with_keep_alive(60_000, 300_000)
        .with_retry(RetryPolicy::default());

    println!("   Endpoint: {}", settings.endpoint());
    println!("   Capacity: {}..{}", settings.min_connections, settings.max_connections);
    println!("   Keep-alive: {}ms\n", settings.keep_alive_interval_ms);

    // Step 2: Start the service (warms up min_connections)
    println!("2. Starting service...");
    let service = Arc::new(FtpPoolService::start(settings).await?);
    let snapshot = service.metrics();
    println!(
        "   ✓ Warmed up: {} idle / {} total\n",
        snapshot.connection_pool.idle_connections, snapshot.connection_pool.total_connections
    );

    // Step 3: Concurrent borrowers sharing the pool
    println!("3. Running 10 concurrent borrow/return cycles...");
    let started = Instant::now();
    let mut tasks = Vec::new();
    for worker in 0..10 {
        let service = Arc::clone(&service);
        tasks.push(tokio::spawn(async move {
            let handle = service.borrow().await?;
            println!("   worker {:2} borrowed connection {}", worker, handle.id());
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            service.give_back(handle).await;
            Ok::<(), ftp_pool_sdk::FtpPoolError>(())
        }));
    }
    for task in tasks {
        task.await??;
    }
    println!("   ✓ All cycles finished in {:?}\n", started.elapsed());

    // Step 4: Inspect the metrics surface
    println!("4. Metrics snapshot:");
    let snapshot = service.metrics();
    println!("   Borrows:        {}", snapshot.throughput.borrows_total);
    println!("   Max wait:       {:.1}ms", snapshot.wait_time.max_wait_ms);
    println!("   Avg borrow:     {:.1}ms", snapshot.performance.borrow.avg_ms);
    println!("   Healthy:        {}", snapshot.health.counts.healthy);
    println!("   Created:        {}", snapshot.connection_pool.connections_created);

    // Step 5: Shut down gracefully
    println!("\n5. Shutting down...");
    service.shutdown().await;
    println!("   ✓ Done");

    Ok(())
}

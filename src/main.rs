mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use constellation::{ConstellationRuntime, ControllerConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?),
        )
        .init();

    match cli.command {
        Commands::Serve { node_name, seed } => {
            let mut config = load_or_default(&cli.config);
            if let Some(name) = node_name {
                config.node_name = name;
            }
            if !seed.is_empty() {
                config.seed_nodes = seed;
                config.enable_clustering = true;
            }

            let runtime = ConstellationRuntime::new(config).await?;
            runtime.start().await?;

            tokio::signal::ctrl_c().await?;
            info!("interrupt received");
            runtime.shutdown().await?;
            // Give the periodic tasks one tick to observe the flag
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }

        Commands::Status { json } => {
            let config = load_or_default(&cli.config);
            let runtime = ConstellationRuntime::new(config).await?;
            let status = runtime.status().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{:<18} {:>10}", "SUBSYSTEM", "SUMMARY");
                println!("{}", "─".repeat(60));
                println!(
                    "{:<18} {} nodes ({} alive, {} suspect, {} dead)",
                    "cluster",
                    status.cluster.total_nodes,
                    status.cluster.alive_nodes,
                    status.cluster.suspect_nodes,
                    status.cluster.dead_nodes
                );
                println!(
                    "{:<18} {:?} (term {})",
                    "consensus", status.consensus.role, status.consensus.current_term
                );
                println!(
                    "{:<18} {} nodes, {} scheduled, {} failed",
                    "scheduler",
                    status.scheduler.registered_nodes,
                    status.scheduler.total_scheduled,
                    status.scheduler.total_failed
                );
                println!(
                    "{:<18} {} vnodes across {} nodes",
                    "dht", status.dht.vnode_count, status.dht.physical_nodes
                );
                println!(
                    "{:<18} {} services ({} healthy)",
                    "registry", status.registry.total_services, status.registry.healthy_services
                );
                println!(
                    "{:<18} {} circuits ({} open)",
                    "circuit-breakers", status.circuits.total_circuits, status.circuits.open_circuits
                );
                println!(
                    "{:<18} {} series, {} samples",
                    "metrics", status.metrics.total_metrics, status.metrics.total_samples
                );
                println!(
                    "{:<18} {} policies, {} scale-ups, {} scale-downs",
                    "autoscaler",
                    status.autoscaler.total_policies,
                    status.autoscaler.total_scale_ups,
                    status.autoscaler.total_scale_downs
                );
                println!(
                    "{:<18} {} rules ({} firing)",
                    "alerts", status.alerts.total_rules, status.alerts.firing_alerts
                );
            }
        }

        Commands::Init { path, force } => {
            let target = std::path::Path::new(&path);
            if target.exists() && !force {
                anyhow::bail!("{path} already exists (use --force to overwrite)");
            }
            let config = ControllerConfig::default();
            std::fs::write(target, config.to_toml()?)?;
            info!("wrote default configuration to {path}");
        }
    }

    Ok(())
}

fn load_or_default(path: &str) -> ControllerConfig {
    ControllerConfig::load(path).unwrap_or_default()
}

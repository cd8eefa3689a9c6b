//! roomshard admin tool
//!
//! Inspect and maintain a running shard topology.
//!
//! ## Usage
//!
//! ```bash
//! roomshard-admin status --save
//! roomshard-admin distribution
//! roomshard-admin query --unit celsius --hours 6
//! roomshard-admin query --location cuisine --type humidity
//! roomshard-admin reset
//! ```

use roomshard::clock::{Clock, SystemClock};
use roomshard::config::ComponentFactory;
use roomshard::query::TelemetryQueries;
use roomshard::report::ReportWriter;
use roomshard::sharding::{
    compute_distribution, SensorType, ShardConnectionManager, ShardRegistry, ShardRouter,
};
use roomshard::telemetry::init_logging;
use roomshard::Config;

use chrono::Utc;
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// roomshard admin tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; defaults apply when absent
    #[arg(long, env = "ROOMSHARD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Where saved reports go
    #[arg(long, env = "REPORT_DIR", default_value = "sharding_admin_reports", global = true)]
    report_dir: PathBuf,

    /// Log level
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reachability, role, memory and key count of every shard
    Status {
        /// Also write a JSON report
        #[arg(long)]
        save: bool,
    },
    /// Series and points per shard
    Distribution {
        /// Also write a JSON report
        #[arg(long)]
        save: bool,
    },
    /// First and last values of recent data
    Query {
        /// Every sensor type measured in this unit, across all rooms
        #[arg(long, conflicts_with = "location")]
        unit: Option<String>,

        /// One room
        #[arg(long, required_unless_present = "unit")]
        location: Option<String>,

        /// Restrict to one sensor type
        #[arg(long = "type")]
        sensor_type: Option<SensorType>,

        /// Look-back in hours
        #[arg(long, default_value = "1")]
        hours: u64,
    },
    /// Delete every sensor series on every reachable shard
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging("roomshard-admin", &args.log_level)?;

    let config = Config::load_or_default(args.config.as_deref())?;
    let registry = Arc::new(ShardRegistry::new(&config.sharding)?);
    let connector = ComponentFactory::create_connector(&registry, &config.sharding.connection)?;
    let mut manager =
        ShardConnectionManager::new(Arc::clone(&registry), connector, &config.sharding.connection);
    if let Some(discovery) = ComponentFactory::create_discovery(&config.sharding.connection)? {
        manager = manager.with_discovery(discovery);
    }
    let manager = Arc::new(manager);
    manager.connect_all().await;

    let router = ShardRouter::new(Arc::clone(&manager))
        .with_fan_out_deadline(config.sharding.connection.fan_out_deadline());
    let reports = ReportWriter::new(&args.report_dir);

    match args.command {
        Command::Status { save } => {
            let shards = manager.probe_all().await;
            let mut table = Table::new();
            table.set_header(vec![
                Cell::new("Shard"),
                Cell::new("Status"),
                Cell::new("Address"),
                Cell::new("Role"),
                Cell::new("Keys"),
                Cell::new("Memory"),
            ]);
            for shard in &shards {
                let status = if shard.reachable {
                    "online".to_string()
                } else {
                    format!("offline ({})", shard.error.as_deref().unwrap_or("unknown"))
                };
                table.add_row(vec![
                    Cell::new(&shard.display_name),
                    Cell::new(status),
                    Cell::new(&shard.addr),
                    Cell::new(shard.role.as_deref().unwrap_or("-")),
                    Cell::new(shard.key_count.map(|k| k.to_string()).unwrap_or_else(|| "-".into())),
                    Cell::new(shard.used_memory.as_deref().unwrap_or("-")),
                ]);
            }
            println!("{table}");

            let online = shards.iter().filter(|s| s.reachable).count();
            println!("{online}/{} shards online", shards.len());
            if save {
                let path = reports.write_status(&shards, Utc::now()).await?;
                println!("Report saved to {}", path.display());
            }
        }
        Command::Distribution { save } => {
            let report = compute_distribution(&router, &registry).await;
            let mut table = Table::new();
            table.set_header(vec![
                Cell::new("Shard"),
                Cell::new("Sensors"),
                Cell::new("Points"),
                Cell::new("Percentage"),
            ]);
            for shard in report.per_shard.values() {
                let name = if shard.reachable {
                    shard.display_name.clone()
                } else {
                    format!("{} (offline)", shard.display_name)
                };
                table.add_row(vec![
                    Cell::new(name),
                    Cell::new(shard.sensor_count),
                    Cell::new(shard.point_count),
                    Cell::new(format!("{:.1}%", shard.percentage)),
                ]);
            }
            table.add_row(vec![
                Cell::new("TOTAL"),
                Cell::new(report.total_sensors),
                Cell::new(report.total_points),
                Cell::new("100.0%"),
            ]);
            println!("{table}");

            if save {
                let path = reports.write_distribution(&report).await?;
                println!("Report saved to {}", path.display());
            }
        }
        Command::Query {
            unit,
            location,
            sensor_type,
            hours,
        } => {
            let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
            let queries = TelemetryQueries::new(router, clock);
            let summary = match (unit, location) {
                (Some(unit), _) => queries.query_by_unit(&unit, sensor_type, hours).await?,
                (None, Some(location)) => {
                    queries.query_location(&location, sensor_type, hours).await?
                }
                (None, None) => return Err("specify --unit or --location".into()),
            };

            let mut table = Table::new();
            table.set_header(vec![
                Cell::new("Location"),
                Cell::new("Type"),
                Cell::new("Sensor"),
                Cell::new("Points"),
                Cell::new("First"),
                Cell::new("Last"),
            ]);
            for row in &summary.rows {
                let (first, last) = match &row.failure {
                    Some(failure) => (format!("unavailable ({})", failure), "-".to_string()),
                    None => (format_value(row.first_value), format_value(row.last_value)),
                };
                table.add_row(vec![
                    Cell::new(&row.location),
                    Cell::new(row.sensor_type),
                    Cell::new(row.sensor_id),
                    Cell::new(row.points),
                    Cell::new(first),
                    Cell::new(last),
                ]);
            }
            println!("{table}");
            println!("{} points over the last {hours}h", summary.total_points);
            if !summary.degraded_locations.is_empty() {
                println!(
                    "Partial result: {} unavailable",
                    summary.degraded_locations.join(", ")
                );
            }
        }
        Command::Reset { force } => {
            if !force && !confirm("Type YES to delete all sensor data on every shard: ")? {
                println!("Aborted");
                return Ok(());
            }
            for location in registry.configured_locations() {
                match router.delete_all_series(location.as_str()).await {
                    Ok(deleted) => println!("{location}: {deleted} series deleted"),
                    Err(e) => println!("{location}: skipped ({e})"),
                }
            }
        }
    }

    Ok(())
}

fn format_value(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.1}")).unwrap_or_else(|| "-".to_string())
}

fn confirm(prompt: &str) -> std::io::Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim() == "YES")
}

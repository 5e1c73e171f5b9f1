use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nvme_stress::config::StressConfig;
use nvme_stress::orchestrator::{Orchestrator, RunState, TestRequest};
use nvme_stress::workload::WorkloadKind;

#[derive(Parser)]
#[command(
    name = "nvme-stress",
    about = "Concurrent NVMe stress testing with live temperature telemetry",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (HTTP API + host telemetry)
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
    },

    /// List devices eligible for testing
    Devices {
        /// Include a health verdict per device
        #[arg(long)]
        health: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the full health dump of a device
    Health {
        /// Device name, e.g. nvme1n1
        device: String,
    },

    /// Stress one device in the foreground (Ctrl-C stops it cleanly)
    Run {
        /// Device name, e.g. nvme1n1
        #[arg(long)]
        device: String,

        /// Test duration in seconds (10 to 86400)
        #[arg(long, default_value = "600")]
        duration: u64,

        /// Workload: ai or standard
        #[arg(long, default_value = "ai")]
        workload: WorkloadKind,

        /// Refuse to run on a mounted device instead of unmounting it
        #[arg(long)]
        no_auto_unmount: bool,

        /// Label prefixed to the log file name
        #[arg(long)]
        label: Option<String>,
    },

    /// Browse run logs
    Logs {
        #[command(subcommand)]
        action: LogsAction,
    },

    /// Summarize every run log in the log directory
    Report {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Also write the JSON report to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum LogsAction {
    /// List run logs, newest first
    List,

    /// Print one run log
    Show {
        /// Log file name
        name: String,
    },
}

fn init_tracing(config: &StressConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{:.1}", v),
        None => "-".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = StressConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting nvme-stress daemon");
            nvme_stress::serve(config).await?;
        }
        Commands::Devices { health, json } => {
            let orchestrator = Orchestrator::new(config);
            let entries = orchestrator.device_entries(health).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("No eligible devices found.");
            } else {
                println!("{:<12} | {:<12} | {:<32} | {:<9} | Health", "Device", "Capacity", "Model", "Mounted");
                println!("{:-<12}-|-{:-<12}-|-{:-<32}-|-{:-<9}-|-{:-<8}", "", "", "", "", "");
                for e in &entries {
                    let verdict = e.health.map(|v| format!("{:?}", v)).unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<12} | {:<12} | {:<32} | {:<9} | {}",
                        e.device.name,
                        e.device.capacity_display(),
                        e.device.model,
                        if e.device.is_mounted() { "yes" } else { "no" },
                        verdict
                    );
                }
            }
        }
        Commands::Health { device } => {
            let orchestrator = Orchestrator::new(config);
            print!("{}", orchestrator.device_health(&device).await?);
        }
        Commands::Run {
            device,
            duration,
            workload,
            no_auto_unmount,
            label,
        } => {
            let orchestrator = Orchestrator::new(config);
            let mut request = TestRequest::new(&device, duration, workload).auto_unmount(!no_auto_unmount);
            if let Some(label) = &label {
                request = request.label(label);
            }

            let id = orchestrator.start_test(request).await?;
            let status = orchestrator.status(id)?;
            println!("Run {} started on {}", id, status.device);
            println!("Log: {}", status.log_file.display());

            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            let finished = loop {
                tokio::select! {
                    _ = &mut ctrl_c => {
                        println!("\nStopping run {}...", id);
                        break orchestrator.stop_test(id).await?;
                    }
                    status = orchestrator.wait(id) => break status?,
                    _ = ticker.tick() => {
                        let s = orchestrator.status(id)?;
                        println!(
                            "[{:>3.0}%] {}s elapsed, {}s remaining",
                            s.progress * 100.0,
                            s.elapsed_secs,
                            s.remaining_secs
                        );
                    }
                }
            };

            println!("Run {} {}", id, finished.state);
            match finished.state {
                RunState::Completed { exit_code: Some(0) } | RunState::Cancelled => {}
                other => bail!("run ended {}", other),
            }
        }
        Commands::Logs { action } => {
            let orchestrator = Orchestrator::new(config);
            match action {
                LogsAction::List => {
                    let logs = orchestrator.list_logs()?;
                    if logs.is_empty() {
                        println!("No logs found in {}.", orchestrator.log_dir().display());
                    } else {
                        println!("{:<60} | {:>10} | Modified", "Name", "Bytes");
                        println!("{:-<60}-|-{:->10}-|-{:-<25}", "", "", "");
                        for log in logs {
                            println!("{:<60} | {:>10} | {}", log.name, log.size, log.modified.to_rfc3339());
                        }
                    }
                }
                LogsAction::Show { name } => {
                    print!("{}", orchestrator.read_log(&name)?.text);
                }
            }
        }
        Commands::Report { json, output } => {
            let orchestrator = Orchestrator::new(config);
            let report = orchestrator.report()?;
            let rendered = serde_json::to_string_pretty(&report)?;
            if let Some(path) = &output {
                std::fs::write(path, &rendered)?;
                tracing::info!(path = %path.display(), "report written");
            }
            if json {
                println!("{}", rendered);
            } else {
                println!("\nnvme-stress Summary Report");
                println!(
                    "{:<10} | {:<6} | {:>10} | {:>10} | {:>12} | {:>12} | {:>8}",
                    "Device", "Result", "Read IOPS", "Write IOPS", "Read MiB/s", "Write MiB/s", "Max C"
                );
                println!("{:-<10}-|-{:-<6}-|-{:->10}-|-{:->10}-|-{:->12}-|-{:->12}-|-{:->8}", "", "", "", "", "", "", "");
                for d in &report.devices {
                    let result = if d.passed {
                        "PASS"
                    } else if d.incomplete {
                        "INCOMP"
                    } else {
                        "FAIL"
                    };
                    println!(
                        "{:<10} | {:<6} | {:>10} | {:>10} | {:>12} | {:>12} | {:>8}",
                        d.device,
                        result,
                        fmt_opt(d.read_iops),
                        fmt_opt(d.write_iops),
                        fmt_opt(d.read_bw_mib),
                        fmt_opt(d.write_bw_mib),
                        fmt_opt(d.max_temp_c)
                    );
                }
                let o = &report.overall;
                println!(
                    "\n{} device(s): {} passed, {} failed, {} incomplete",
                    o.devices, o.passed, o.failed, o.incomplete
                );
                if let (Some(dev), Some(t)) = (&o.hottest_device, o.hottest_temp_c) {
                    println!("Hottest: {} at {:.0} C", dev, t);
                }
            }
        }
    }

    Ok(())
}

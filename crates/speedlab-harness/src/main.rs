//! speedlab harness
//!
//! Brings up a shaped two-host lab in network namespaces, normalizes the
//! interfaces, starts packet captures and the test programs, then hands
//! control to the operator until exit.
//!
//! - `run`: the whole workflow (default lab without `--config`)
//! - `check`: validate a lab file and print the interface plan
//! - `cleanup`: remove namespaces left behind by a crashed run

mod prompt;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use speedlab_sim::backend::NetnsBackend;
use speedlab_sim::config::LabConfig;
use speedlab_sim::prompt::{ImmediatePrompt, OperatorPrompt, TimedPrompt};
use speedlab_sim::workflow;
use tracing_subscriber::EnvFilter;

/// Shaped virtual-link test harness.
#[derive(Parser, Debug)]
#[command(name = "speedlab", about = "Shaped virtual-link test harness")]
struct Cli {
    /// Lab description (TOML). The built-in two-host lab is used when omitted.
    #[arg(long, short, global = true, env = "SPEEDLAB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Bring the lab up, run the workloads and hand over to the operator.
    Run(RunArgs),
    /// Validate the lab description and print the interface plan.
    Check,
    /// Delete namespaces left over from an earlier run.
    Cleanup,
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Directory for captures, workload output and the run report.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Do not start packet captures.
    #[arg(long, default_value_t = false)]
    no_capture: bool,

    /// Keep the lab up for this many seconds instead of prompting.
    #[arg(long, conflicts_with = "no_prompt")]
    duration: Option<u64>,

    /// Tear down as soon as everything has started.
    #[arg(long, default_value_t = false)]
    no_prompt: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Cmd::Run(RunArgs::default())) {
        Cmd::Run(args) => run(config, args),
        Cmd::Check => {
            print_plan(&config);
            Ok(())
        }
        Cmd::Cleanup => cleanup(&config),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<LabConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            LabConfig::from_toml_str(&raw).with_context(|| format!("loading {}", path.display()))
        }
        None => LabConfig::builtin().context("loading built-in lab"),
    }
}

fn run(mut config: LabConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if args.no_capture {
        config.capture = None;
    }

    // SIGINT ends the interactive phase; teardown then runs as usual.
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("installing Ctrl-C handler")?;

    let mut prompt: Box<dyn OperatorPrompt> = if args.no_prompt {
        Box::new(ImmediatePrompt)
    } else if let Some(secs) = args.duration {
        Box::new(TimedPrompt::new(Duration::from_secs(secs), shutdown))
    } else {
        Box::new(prompt::StdinPrompt::new(shutdown))
    };

    tracing::info!(
        endpoints = config.topology.endpoints().len(),
        links = config.topology.links().len(),
        workloads = config.workloads.len(),
        capture = config.capture.is_some(),
        output_dir = %config.output_dir.display(),
        "speedlab starting"
    );

    let backend = NetnsBackend::new(
        config.backend.namespace_prefix.clone(),
        config.backend.use_sudo,
    );
    let report = workflow::run(&config, backend, prompt.as_mut()).context("lab run failed")?;

    for failure in &report.spawn_failures {
        tracing::warn!(
            endpoint = %failure.endpoint,
            label = %failure.label,
            error = %failure.error,
            "background process was not started"
        );
    }
    tracing::info!(
        processes = report.processes.len(),
        failed = report.spawn_failures.len(),
        report = %config.output_dir.join(workflow::REPORT_FILE).display(),
        "speedlab finished"
    );
    Ok(())
}

fn print_plan(config: &LabConfig) {
    let topo = &config.topology;
    println!("endpoints:");
    for ep in topo.endpoints() {
        let addr = if config.session.assign_addresses {
            format!("{}/8", ep.default_address())
        } else {
            "-".to_string()
        };
        println!("  {:<12} {:<16} {}", ep.name, addr, ep.interfaces.len());
        for iface in &ep.interfaces {
            println!("    {:<16} link {}", iface.name, iface.link);
        }
    }
    println!("links:");
    for link in topo.links() {
        println!(
            "  #{} {} <-> {}  {} kbit/s  {} ms",
            link.index,
            link.a_interface,
            link.b_interface,
            link.shaping.rate_kbit,
            link.shaping.delay.as_millis()
        );
    }
    println!("offloads off: {}", config.normalize.offloads.join(", "));
    println!(
        "capture: {}",
        if config.capture.is_some() { "on" } else { "off" }
    );
    for w in &config.workloads {
        println!("workload {} @ {}: {}", w.label, w.endpoint, w.command);
    }
}

fn cleanup(config: &LabConfig) -> anyhow::Result<()> {
    let mut backend = NetnsBackend::new(
        config.backend.namespace_prefix.clone(),
        config.backend.use_sudo,
    );
    let removed = backend
        .cleanup(config.topology.endpoint_names())
        .context("cleaning up namespaces")?;
    if removed.is_empty() {
        tracing::info!("nothing to clean up");
    }
    for ns in removed {
        tracing::info!(namespace = %ns, "removed leftover namespace");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_the_default_command() {
        let cli = Cli::try_parse_from(["speedlab"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn duration_conflicts_with_no_prompt() {
        let err = Cli::try_parse_from(["speedlab", "run", "--duration", "5", "--no-prompt"]);
        assert!(err.is_err());
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["speedlab", "check", "--config", "lab.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("lab.toml")));
        assert!(matches!(cli.command, Some(Cmd::Check)));
    }

    #[test]
    fn builtin_config_loads_without_a_file() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.topology.endpoints().len(), 2);
    }
}

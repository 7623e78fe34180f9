// main.rs

mod config;
mod swarm;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{value_parser, Arg, ArgMatches, Command};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::SimConfig;
use crate::swarm::{load_all, run_session, InputDirSource, OutputDirSink, SessionReport, SwarmError};

/// Command line of the simulator. Every peer `i` reads `in<i>.txt` from the
/// input directory; completed files land in the output directory as
/// `client<i>_<file>`.
fn create_command() -> Command {
    Command::new("swarmsim")
        .about("Simulated tracker-coordinated segment swarm")
        .arg(
            Arg::new("peers")
                .long("peers")
                .short('n')
                .help("Number of peer processes (the tracker is extra)")
                .value_name("N")
                .required(true)
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("input-dir")
                .long("input-dir")
                .help("Directory holding in<rank>.txt manifests")
                .value_name("DIR")
                .default_value(".")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("output-dir")
                .long("output-dir")
                .help("Directory that receives client<rank>_<file> outputs")
                .value_name("DIR")
                .default_value(".")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("JSON file with simulation settings")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("refresh-interval")
                .long("refresh-interval")
                .help("Segments fetched between swarm refreshes")
                .value_name("N")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("serve-delay-ms")
                .long("serve-delay-ms")
                .help("Artificial delay before each segment is served")
                .value_name("MS")
                .value_parser(value_parser!(u64)),
        )
}

fn load_config(matches: &ArgMatches) -> Result<SimConfig, SwarmError> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };
    if let Some(&interval) = matches.get_one::<usize>("refresh-interval") {
        config = config.with_refresh_interval(interval);
    }
    if let Some(&delay) = matches.get_one::<u64>("serve-delay-ms") {
        config = config.with_serve_delay_ms(delay);
    }
    config.validate()?;
    Ok(config)
}

async fn run(matches: ArgMatches) -> Result<SessionReport, SwarmError> {
    let config = load_config(&matches)?;
    let peers = matches
        .get_one::<usize>("peers")
        .copied()
        .ok_or_else(|| SwarmError::Config("--peers is required".into()))?;
    let input_dir = matches
        .get_one::<PathBuf>("input-dir")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("."));
    let output_dir = matches
        .get_one::<PathBuf>("output-dir")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("."));

    let manifests = load_all(&InputDirSource::new(&input_dir), peers)?;
    std::fs::create_dir_all(&output_dir)?;
    info!(peers, input = %input_dir.display(), output = %output_dir.display(), "inputs loaded");

    run_session(config, manifests, Arc::new(OutputDirSink::new(output_dir))).await
}

/// `RUST_LOG` when set and valid, `info` otherwise
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn log_report(report: &SessionReport) {
    for peer in &report.peers {
        info!(
            rank = peer.id,
            completed = ?peer.completed,
            files_held = peer.owned.len(),
            download = ?peer.download,
            upload = ?peer.upload,
            "peer summary"
        );
        for (file, reason) in &peer.failed {
            warn!(rank = peer.id, %file, %reason, "file not downloaded");
        }
    }
    info!(
        peers = report.peers.len(),
        files = report.tracker.swarms.len(),
        failed = report.failed_files(),
        "simulation complete"
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt().with_env_filter(log_filter(directives.as_deref())).init();

    let matches = create_command().get_matches();
    match run(matches).await {
        Ok(report) => {
            log_report(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "simulation failed");
            ExitCode::FAILURE
        }
    }
}

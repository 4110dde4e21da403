// Binary entrypoint: parse the command line, set up logging and metrics, dispatch the command.
mod cli;
mod config;
mod dump;
mod error;
mod keys;
mod libnfc;
mod mifare;
mod parser;
mod pipeline;
mod pn532;
mod reader;
mod spoolman;
mod telemetry;

use clap::Parser;
use tracing::{error, info};

use cli::{Backend, Cli, Commands, ParseArgs, ScanArgs};
use config::{ParseSettings, PublishSettings, ScanSettings};
use error::Result;
use libnfc::LibnfcSource;
use pipeline::PublishOutcome;
use pn532::Pn532;
use reader::{ClassicSource, TagSource};
use spoolman::SpoolmanClient;

/// Exit status after Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

fn publisher(settings: Option<&PublishSettings>) -> Result<Option<SpoolmanClient>> {
    settings.map(|p| SpoolmanClient::new(&p.url, p.timeout)).transpose()
}

async fn scan_with<S: TagSource>(mut source: S, settings: &ScanSettings) -> Result<i32> {
    let client = publisher(settings.publish.as_ref())?;
    tokio::select! {
        res = pipeline::run_scan(&mut source, settings, client.as_ref()) => {
            let stats = res?;
            info!(processed = stats.processed, failed = stats.failed, "scan finished");
            Ok(0)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(EXIT_INTERRUPTED)
        }
    }
}

async fn scan(args: &ScanArgs) -> Result<i32> {
    let settings = ScanSettings::from_args(args)?;
    match settings.backend {
        Backend::Pn532 => {
            let reader = Pn532::open_serial(&settings.device, settings.baud)?;
            let source = ClassicSource::new(reader, settings.keys.clone(), settings.scan_timeout, settings.poll_interval);
            scan_with(source, &settings).await
        }
        Backend::Libnfc => {
            let mut source = LibnfcSource::new(settings.keys.clone(), settings.scan_timeout, settings.poll_interval)?;
            if let Some(dir) = &settings.libnfc_dir {
                let tool = |name: &str| dir.join(name).to_string_lossy().into_owned();
                source = source.with_programs(tool("nfc-list"), tool("nfc-mfclassic"));
            }
            scan_with(source, &settings).await
        }
    }
}

async fn parse(args: &ParseArgs) -> Result<i32> {
    let settings = ParseSettings::from_args(args)?;
    let dump = dump::load_dump(&args.dump)?;
    info!(path = %args.dump.display(), uid = %dump.uid(), blocks = dump.present_count(), "dump loaded");
    let client = publisher(settings.publish.as_ref())?;
    let processed = pipeline::process_dump(&dump, &settings.output, client.as_ref()).await?;
    println!("{}", serde_json::to_string_pretty(&processed.decoded.spool)?);
    Ok(match processed.publish {
        PublishOutcome::Failed(_) => 1,
        PublishOutcome::Acked(_) | PublishOutcome::Skipped => 0,
    })
}

async fn run(cli: &Cli) -> Result<i32> {
    if let Some(addr) = &cli.metrics_addr {
        telemetry::install_metrics(addr)?;
    }
    match &cli.command {
        Commands::Scan(args) => scan(args).await,
        Commands::Parse(args) => parse(args).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = match config::log_level(&cli) {
        Ok(level) => level,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    };
    telemetry::init_tracing(level);

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

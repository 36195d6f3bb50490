use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use tidegate_core::{telemetry, version};
use tracing::info;

/// BSD sysexits EX_USAGE.
const EX_USAGE: u8 = 64;
const EX_INIT: u8 = 2;

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
#[command(disable_version_flag = true)]
struct Args {
	/// Use config from bytes
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Parse and validate the configuration, then exit
	#[arg(long)]
	validate_only: bool,

	/// Print version (as a simple version string)
	#[arg(short = 'V')]
	version_short: bool,

	/// Print version (as JSON)
	#[arg(long = "version")]
	version_long: bool,
}

fn main() -> ExitCode {
	telemetry::setup_logging();

	let args = match Args::try_parse() {
		Ok(args) => args,
		Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
			let _ = e.print();
			return ExitCode::SUCCESS;
		},
		Err(e) => {
			let _ = e.print();
			return ExitCode::from(EX_USAGE);
		},
	};

	if args.version_short {
		println!("{}", version::BuildInfo::new().version);
		return ExitCode::SUCCESS;
	}
	if args.version_long {
		println!("{}", version::BuildInfo::new());
		return ExitCode::SUCCESS;
	}

	match run(args) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			eprintln!("error: {e:#}");
			ExitCode::from(EX_INIT)
		},
	}
}

fn run(args: Args) -> anyhow::Result<()> {
	let (contents, filename) = match (args.config, args.file) {
		(Some(_), Some(_)) => {
			anyhow::bail!("only one of --config or --file")
		},
		(Some(config), None) => (config, None),
		(None, Some(file)) => {
			let contents = std::fs::read_to_string(&file)?;
			(contents, Some(file))
		},
		(None, None) => ("{}".to_string(), None),
	};
	let loaded = tidegate::config::parse_config(contents, filename)?;
	if args.validate_only {
		println!("Configuration is valid!");
		return Ok(());
	}

	let mut builder = tokio::runtime::Builder::new_multi_thread();
	if loaded.config.worker_threads > 0 {
		builder.worker_threads(loaded.config.worker_threads);
	}
	builder
		.enable_all()
		.build()
		.expect("failed to build runtime")
		.block_on(async move {
			info!("version: {}", version::BuildInfo::new());
			info!(
				"running with config: {}",
				serde_yaml::to_string(&loaded.config)?
			);
			tidegate::app::run(loaded).await?.wait_termination().await
		})
}

use std::path::PathBuf;

use clap::Parser;
use skipper::{Config, app, telemetry};

#[derive(Parser)]
#[command(name = "skipper", about = "Extensible HTTP reverse proxy and router")]
struct Args {
	/// Path to the YAML configuration file.
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Override the listen address from the config file.
	#[arg(long)]
	address: Option<std::net::SocketAddr>,

	/// Route files to serve, in addition to any from the config file.
	#[arg(long = "routes")]
	route_files: Vec<PathBuf>,

	/// Replace response bodies with a JSON report of the routing decision.
	#[arg(long)]
	debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let mut cfg = match &args.config {
		Some(path) => Config::load(path)?,
		None => Config::default(),
	};
	if let Some(address) = args.address {
		cfg.listen.address = address;
	}
	cfg.routing.route_files.extend(args.route_files);
	if args.debug {
		cfg.proxy.debug = true;
	}

	telemetry::log::init(&cfg.log_level.0);
	app::run(cfg).await
}

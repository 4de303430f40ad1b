mod config;
mod host;

use std::path::PathBuf;

use config::HostConfig;
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

fn main() {
	let args: Vec<String> = std::env::args().skip(1).collect();

	let Some(command) = args.first() else {
		print_usage();
		return;
	};

	match command.as_str() {
		"help" | "--help" | "-h" => print_usage(),
		"version" | "--version" | "-V" => println!("modhost {}", env!("CARGO_PKG_VERSION")),
		"run" => cmd_run(&args[1..]),
		"check" => cmd_check(&args[1..]),
		"modules" => cmd_modules(&args[1..]),
		"paths" => cmd_paths(&args[1..]),
		other => {
			eprintln!("unknown command: {}", other);
			eprintln!("run 'modhost help' for usage");
			std::process::exit(1);
		}
	}
}

fn print_usage() {
	eprintln!("{} {}: plugin module host", "modhost".bold(), env!("CARGO_PKG_VERSION"));
	eprintln!();
	eprintln!("usage: {} <command> [--config <path>]", "modhost".bold());
	eprintln!();
	eprintln!("{}", "commands".cyan().bold());
	eprintln!("  {}        Run configured instances in the foreground", "run".bold());
	eprintln!("  {}      Validate the config and list its instances", "check".bold());
	eprintln!("  {}    List installed modules and versions", "modules".bold());
	eprintln!("  {}      Show config, module, runtime and log locations", "paths".bold());
	eprintln!();
	eprintln!("{}", "signals (run)".cyan().bold());
	eprintln!("  {}     Reload the config and apply changed instances", "SIGHUP".bold());
	eprintln!("  {}    Print the instance table", "SIGUSR1".bold());
	eprintln!("  {}    Stop every instance and exit", "SIGTERM".bold());
	eprintln!();
	eprintln!("Log verbosity follows {} (default: info).", "RUST_LOG".bold());
}

/// `--config <path>` or `-c <path>`, falling back to the XDG location.
fn config_path(args: &[String]) -> PathBuf {
	let mut iter = args.iter();
	while let Some(arg) = iter.next() {
		if arg == "--config" || arg == "-c" {
			if let Some(path) = iter.next() {
				return PathBuf::from(path);
			}
			eprintln!("{} needs a path", arg);
			std::process::exit(1);
		}
		if let Some(path) = arg.strip_prefix("--config=") {
			return PathBuf::from(path);
		}
	}
	config::default_config_path()
}

fn load_config(path: &std::path::Path) -> HostConfig {
	match HostConfig::load(path) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("error: {}", e);
			std::process::exit(1);
		}
	}
}

fn runtime() -> tokio::runtime::Runtime {
	match tokio::runtime::Runtime::new() {
		Ok(rt) => rt,
		Err(e) => {
			eprintln!("error: failed to start async runtime: {}", e);
			std::process::exit(1);
		}
	}
}

fn cmd_run(args: &[String]) {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let path = config_path(args);
	let config = load_config(&path);
	if let Err(e) = runtime().block_on(host::run(&path, config)) {
		eprintln!("error: {}", e);
		std::process::exit(1);
	}
}

fn cmd_check(args: &[String]) {
	let path = config_path(args);
	let config = load_config(&path);
	println!("{}", path.display().dimmed());
	if config.instances.is_empty() {
		println!("{}", "no instances configured".dimmed());
		return;
	}
	let width = config.instances.keys().map(|k| k.len()).max().unwrap_or(0);
	for (id, instance) in &config.instances {
		let circle = if instance.enabled { "●".green().to_string() } else { "○".dimmed().to_string() };
		let version = instance.version.as_deref().unwrap_or("latest");
		println!(
			"{} {:<width$} {} {}@{}",
			circle,
			id,
			instance.module_type,
			instance.module_id,
			version,
			width = width
		);
	}
}

fn cmd_modules(args: &[String]) {
	let config = load_config(&config_path(args));
	runtime().block_on(host::list_modules(&config));
}

fn cmd_paths(args: &[String]) {
	let path = config_path(args);
	let config = load_config(&path);
	println!("{:<9} {}", "config", path.display());
	println!("{:<9} {}", "modules", config.modules_dir().display());
	println!("{:<9} {}", "runtimes", config.runtimes_dir().display());
	println!("{:<9} {}", "logs", config.log_dir().display());
}

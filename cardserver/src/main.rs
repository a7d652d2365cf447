//! cardserver: DVB card server host and inspection tool.
//!
//! `cardserver host` serves the framed protocol on stdin/stdout; `cardserver
//! status` attaches a profile and prints the server state.

use std::io;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::{error, info};

use cardserver::config::ConfigFile;
use cardserver::logging::{self, ConsoleTarget};
use cardserver::server::{serve, InMemoryCardServer, OutOfProcessCardServer, ServerImplementation};

/// cardserver - DVB card server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long, global = true)]
    log_retention_days: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve requests on stdin/stdout
    Host,
    /// Attach a profile and print the server state as JSON
    Status {
        /// Profile to attach
        profile: String,

        /// Transponder or source selection key to tune first
        #[arg(short, long)]
        select: Option<String>,

        /// Run the card server in a child process
        #[arg(long)]
        remote: bool,
    },
}

fn status(server: &ServerImplementation, profile: &str, select: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    server.begin_attach_profile(profile, false, false, false)?.result()?;
    if let Some(selection) = select {
        server.begin_select(selection)?.result()?;
    }
    let state = server.begin_get_state()?.result()?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // explicit path > ./cardserver.toml > defaults
    let (file_config, config_path) = match ConfigFile::discover(args.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Failed to load config file: {}", e);
            return Err(e.into());
        }
    };

    // command line takes precedence
    let log_dir = args
        .log_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs")));
    let log_retention_days = args
        .log_retention_days
        .unwrap_or_else(|| file_config.logging.retention_days.unwrap_or(7));
    let console = match args.command {
        Command::Host => ConsoleTarget::Stderr,
        Command::Status { .. } => ConsoleTarget::Stdout,
    };
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
        console,
    )?;

    if let Some(path) = &config_path {
        info!("Loaded config from: {}", path.display());
    }
    let config = file_config.config();

    match &args.command {
        Command::Host => {
            let environment = file_config.simulation()?;
            let server = InMemoryCardServer::create(environment.environment(), config);
            info!("cardserver host starting (pid {})", std::process::id());

            let stdin = io::stdin();
            let stdout = io::stdout();
            if let Err(e) = serve(&server, &mut stdin.lock(), &mut stdout.lock()) {
                error!("Host stopped: {}", e);
                return Err(e.into());
            }
        }
        Command::Status { profile, select, remote } => {
            let server = if *remote {
                let program = std::env::current_exe()?;
                let program = program.to_string_lossy();
                let mut host_args = vec!["host".to_string()];
                if let Some(path) = &config_path {
                    host_args.push("--config".to_string());
                    host_args.push(path.to_string_lossy().into_owned());
                }
                let host_args: Vec<&str> = host_args.iter().map(String::as_str).collect();
                OutOfProcessCardServer::spawn(&program, &host_args)?.into_server()
            } else {
                InMemoryCardServer::create(file_config.simulation()?.environment(), config)
            };

            if let Err(e) = status(&server, profile, select.as_deref()) {
                error!("Status failed: {}", e);
                return Err(e);
            }
        }
    }

    Ok(())
}

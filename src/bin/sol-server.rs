//! `sol-server <CONFIG>`: runs the storage server until a signal asks
//! it to stop, then prints a summary of the table's final state.
//!
//! SIGHUP requests a soft shutdown (finish serving connected
//! clients); SIGINT, SIGQUIT, and SIGTERM request a hard shutdown.
use clap::Parser;
use env_logger::Env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::OnceLock;

use sol_storage::Config;
use sol_storage::Context;
use sol_storage::Server;

#[derive(Parser, Debug)]
#[command(name = "sol-server", version)]
#[command(about = "In-memory file storage server with bounded capacity")]
struct Args {
    /// Path to the TOML configuration file
    config: PathBuf,
}

/// Signal handlers only ever read this, and then store to atomics.
static CONTEXT: OnceLock<Arc<Context>> = OnceLock::new();

extern "C" fn on_soft_signal(_: libc::c_int) {
    if let Some(context) = CONTEXT.get() {
        context.shutdown.request_soft();
    }
}

extern "C" fn on_hard_signal(_: libc::c_int) {
    if let Some(context) = CONTEXT.get() {
        context.shutdown.request_hard();
    }
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGHUP, on_soft_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_hard_signal as libc::sighandler_t);
        libc::signal(libc::SIGQUIT, on_hard_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_hard_signal as libc::sighandler_t);
        // Clients may hang up while we're writing to them.
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn init_logging(config: &Config) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();

    if let Some(path) = &config.log_filepath {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!(
                "Couldn't open log file {}: {}. Logging to stderr.",
                path.display(),
                e
            ),
        }
    }

    let _ = builder.try_init();
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Couldn't read the configuration file: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config);
    log::info!("Starting server with {:?}.", config);

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Couldn't listen for incoming connections: {}.", e);
            return ExitCode::FAILURE;
        }
    };

    let _ = CONTEXT.set(server.context());
    install_signal_handlers();

    match server.run() {
        Ok(summary) => {
            log::info!("Goodbye!");
            print!("{}", summary);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Server failed: {}.", e);
            ExitCode::FAILURE
        }
    }
}

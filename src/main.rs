use std::net::TcpListener;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tinydb::config::{self, Config};

#[derive(Parser)]
#[command(name = "tinydb", about = "A small SQL database engine.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the TCP server.
    Listen {
        /// Path to a YAML config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a temporary in-memory smoke test and exit.
    Start,
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();
}

fn listen(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let cfg = match &config_path {
        Some(path) => config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    init_tracing(&cfg.log_level);

    let backend = tinydb::open_backend(&cfg.data_directory, cfg.page_size)
        .with_context(|| format!("opening database in {}", cfg.data_directory.display()))?;
    let listener = TcpListener::bind(&cfg.listen_address)
        .with_context(|| format!("binding {}", cfg.listen_address))?;
    tinydb::server::serve(listener, backend, cfg.max_receive_buffer)?;
    Ok(())
}

/// Exercises the whole stack against an in-memory store and prints what
/// comes back.
fn start() -> anyhow::Result<()> {
    init_tracing("info");
    let backend = tinydb::open_memory_backend(4096);
    let statements = [
        "CREATE TABLE smoke (name text)",
        "INSERT INTO smoke (name) VALUES ('it')",
        "INSERT INTO smoke (name) VALUES ('works')",
        "SELECT * FROM smoke",
    ];
    for sql in statements {
        println!("> {}", sql);
        let stmt = backend.prepare(sql)?;
        let exec = backend.exec(&stmt)?;
        for row in exec.rows.iter() {
            use itertools::Itertools;
            println!("{}", row.iter().map(|v| v.to_string()).join("|"));
        }
        exec.wait()?;
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Listen { config } => listen(config),
        Commands::Start => start(),
    };
    if let Err(e) = result {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

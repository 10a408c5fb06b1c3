#[macro_use]
extern crate log;

extern crate simple_logger;

extern crate clap;

extern crate reactor_server;

use clap::Parser;

use log::Level;

use std::path::PathBuf;
use std::process;
use std::str::FromStr;

use reactor_server::file_client;
use reactor_server::{Config, Endpoint, FileClient, ServerStatus, TcpServer};

/// Serve static files over a multithreaded reactor.
#[derive(Debug, Parser)]
#[command(name = "reactor-server", version)]
struct Args {
    /// Port to listen on, overriding the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file to read, if it exists.
    #[arg(short, long, default_value = "./config.toml")]
    config: PathBuf,
}

fn main() {
    let args = Args::parse();

    // Logging isn't up until the config is read, so failures here go straight to stderr.
    let mut config = if args.config.exists() {
        match Config::from_file(&args.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Could not load {:?}: {}", args.config, e);
                process::exit(1);
            }
        }
    } else {
        Config::default()
    };
    if let Some(port) = args.port {
        config.port = port;
    }

    let level = Level::from_str(&config.log_level).unwrap_or(Level::Info);
    if let Err(e) = simple_logger::init_with_level(level) {
        eprintln!("Could not start logging: {}", e);
    }

    file_client::set_root_dir(config.root_dir.clone());

    let server: TcpServer<FileClient> = match TcpServer::from_config(&config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Could not create server: {}", e);
            process::exit(1);
        }
    };
    let mut server = server
        .on_connect(|client: &FileClient| {
            info!("Client {}:{} connected", client.host(), client.port());
        })
        .on_disconnect(|client: &FileClient| {
            info!("Client {}:{} disconnected", client.host(), client.port());
        });

    let status = server.start();
    if status != ServerStatus::Up {
        eprintln!("Server failed to start: {:?}", status);
        process::exit(1);
    }
    info!(
        "Serving {:?} on port {} with up to {} workers",
        config.root_dir,
        server.port(),
        config.threads
    );

    if let Err(e) = server.join_loop() {
        error!("Server stopped: {}", e);
        eprintln!("Server stopped: {}", e);
        process::exit(1);
    }
}

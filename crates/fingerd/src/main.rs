// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;
use tracing::error;

use fingerd::agent::{self, UtmpSource};
use fingerd::config::Config;
use fingerd::dump;
use fingerd::server::{Server, ServerDeps};

#[derive(Parser)]
#[command(
    name = "fingerd",
    version,
    about = "Aggregates who-is-logged-in reports and answers finger queries."
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(default_value = "config")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::default();
    config.apply_file(&cli.config);

    if config.is_server {
        let server = match Server::bind(config, cli.config.clone(), ServerDeps::system()).await {
            Ok(server) => server,
            Err(e) => {
                error!("fatal: {e:#}");
                let code = if e.downcast_ref::<dump::ParseError>().is_some() { 2 } else { 1 };
                std::process::exit(code);
            }
        };
        if let Err(e) = server.run().await {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    } else if config.is_client {
        if let Err(e) = agent::run(config, Box::new(UtmpSource::new())).await {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    } else {
        eprintln!("error: neither server nor client role configured");
        std::process::exit(1);
    }
}

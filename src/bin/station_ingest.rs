// station_ingest - Ingest tools for a Campbell datalogger weather station
//
// Copyright 2024 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use clap::Parser;
use reqwest::{Client, Url};
use station_ingest::client::CsapiClient;
use station_ingest::poll::{Poller, PollerConfig, RecordSink};
use std::env;
use std::error::Error;
use std::io;
use std::process;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::watch;
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_LOGGER_URL: &str = "http://10.100.17.162/";
const DEFAULT_TABLE: &str = "ClimaVue_10Sec";
const DEFAULT_POLL_SECS: u64 = 10;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
const DEFAULT_TIMEOUT_MILLIS: u64 = 10000;

const USER_ENV: &str = "CAMPBELL_USER";
const PASSWORD_ENV: &str = "CAMPBELL_PASSWORD";

#[derive(Debug, Parser)]
#[clap(name = "station_ingest", version = clap::crate_version!())]
struct StationIngestApplication {
    /// Base URL of the datalogger's web interface
    #[clap(long, default_value_t = DEFAULT_LOGGER_URL.into())]
    logger_url: String,

    /// Name of the data table to poll for its most recent record
    #[clap(long, default_value_t = DEFAULT_TABLE.into())]
    table: String,

    /// Seconds between the start of one polling cycle and the next
    #[clap(long, default_value_t = DEFAULT_POLL_SECS)]
    poll_secs: u64,

    /// Attempts per polling cycle before giving up until the next cycle
    #[clap(long, default_value_t = DEFAULT_MAX_RETRIES, value_parser = clap::value_parser!(u32).range(1..))]
    max_retries: u32,

    /// Seconds between attempts within a polling cycle
    #[clap(long, default_value_t = DEFAULT_RETRY_DELAY_SECS)]
    retry_delay_secs: u64,

    /// Timeout for requests to the datalogger, in milliseconds
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Forward each record to this URL as a key=value POST instead of
    /// printing it to standard output
    #[clap(long)]
    forward_url: Option<String>,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = StationIngestApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    // Credentials are required before any polling starts
    dotenvy::dotenv().ok();
    let username = require_env(USER_ENV);
    let password = require_env(PASSWORD_ENV);

    let base_url = Url::parse(&opts.logger_url).unwrap_or_else(|e| {
        tracing::error!(message = "invalid logger URL", url = %opts.logger_url, error = %e);
        process::exit(1)
    });

    let timeout = Duration::from_millis(opts.timeout_millis);
    let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    let sink = match &opts.forward_url {
        Some(raw) => {
            let url = Url::parse(raw).unwrap_or_else(|e| {
                tracing::error!(message = "invalid forward URL", url = %raw, error = %e);
                process::exit(1)
            });
            RecordSink::Forward {
                client: Client::new(),
                url,
            }
        }
        None => RecordSink::Console,
    };

    let client = CsapiClient::new(http_client, base_url, &username, &password);
    let config = PollerConfig {
        table: opts.table.clone(),
        poll_interval: Duration::from_secs(opts.poll_secs),
        max_retries: opts.max_retries,
        retry_delay: Duration::from_secs(opts.retry_delay_secs),
    };
    let poller = Poller::new(client, config, sink);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        // Wait for either SIGTERM or SIGINT to shutdown
        tokio::select! {
            _ = sigterm() => {}
            _ = sigint() => {}
        }
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(
        message = "logger polling started",
        logger_url = %opts.logger_url,
        table = %opts.table,
        poll_secs = opts.poll_secs,
        max_retries = opts.max_retries,
    );
    poller.run(shutdown_rx).await;

    tracing::info!("poller shutdown");
    Ok(())
}

fn require_env(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| {
        tracing::error!(message = "required environment variable not set", name = %name);
        process::exit(1)
    })
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}

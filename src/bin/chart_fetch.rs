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
use reqwest::Client;
use station_ingest::charts;
use std::error::Error;
use std::path::Path;
use std::process;
use std::time::Duration;
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_SAVE_DIR: &str = "bom_images";
const DEFAULT_TIMEOUT_MILLIS: u64 = 30000;

#[derive(Debug, Parser)]
#[clap(name = "chart_fetch", version = clap::crate_version!())]
struct ChartFetchApplication {
    /// Directory that downloaded chart images are written into, created if
    /// it doesn't exist. Existing images with the same file name are
    /// overwritten
    #[clap(long, default_value_t = DEFAULT_SAVE_DIR.into())]
    save_dir: String,

    /// Timeout for requests to the chart server, in milliseconds
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = ChartFetchApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let timeout = Duration::from_millis(opts.timeout_millis);
    let client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    match charts::fetch_charts(&client, Path::new(&opts.save_dir)).await {
        Ok(written) => {
            tracing::info!(message = "chart download complete", written = written, save_dir = %opts.save_dir);
            Ok(())
        }
        Err(e) => {
            tracing::error!(message = "chart download failed", error = %e);
            process::exit(1)
        }
    }
}

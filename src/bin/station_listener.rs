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
use station_ingest::ingest::{self, AppState, DbConfig};
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use tokio::signal::unix::{self, SignalKind};
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8080);
const DEFAULT_TABLE: &str = "setup_test";

#[derive(Debug, Parser)]
#[clap(name = "station_listener", version = clap::crate_version!())]
struct StationListenerApplication {
    /// Address to bind to. By default, station_listener binds to a public
    /// address since the logger POSTs to it from elsewhere on the network
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,

    /// Database table that received records are inserted into
    #[clap(long, default_value_t = DEFAULT_TABLE.into())]
    table: String,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = StationListenerApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    dotenvy::dotenv().ok();
    let db_config = DbConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(message = "incomplete database configuration", error = %e);
        process::exit(1)
    });

    let pool = ingest::connect(&db_config).await.unwrap_or_else(|e| {
        tracing::error!(message = "unable to connect to database", error = %e);
        process::exit(1)
    });

    // The column allow-list is fetched once and fixed for the process lifetime
    let columns = ingest::table_columns(&pool, &opts.table).await.unwrap_or_else(|e| {
        tracing::error!(message = "unable to fetch table columns", table = %opts.table, error = %e);
        process::exit(1)
    });
    if columns.is_empty() {
        tracing::error!(message = "table has no columns", table = %opts.table);
        process::exit(1)
    }
    tracing::info!(message = "loaded table columns", table = %opts.table, columns = ?columns);

    let state = Arc::new(AppState {
        pool,
        table: opts.table.clone(),
        columns,
    });
    let app = ingest::router(state);

    let server = axum::Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
        process::exit(1)
    });

    tracing::info!(message = "server started", address = %opts.bind, table = %opts.table);
    server
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    tracing::info!("server shutdown");
    Ok(())
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

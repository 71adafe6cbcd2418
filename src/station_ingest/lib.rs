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

//! Ingest tools for a Campbell datalogger weather station
//!
//! ## Features
//!
//! `station_ingest` is a small set of daemons and tools built around a Campbell
//! datalogger that exposes its data tables over HTTP (the `csapi` query API):
//!
//! * `station_ingest` - polls the logger for the most recent record of a data
//!   table on a fixed interval, with a bounded number of retries per cycle, and
//!   either prints the normalized record to standard output or forwards it to
//!   the listener as a `key=value` POST.
//! * `station_listener` - a one-route HTTP server that accepts the
//!   comma-separated `key=value` payloads the logger (or the poller) POSTs,
//!   filters the keys against the target table's columns, and inserts one row
//!   per request into Postgres. Useful when the logger itself is configured to
//!   push via `HTTPPost`.
//! * `chart_fetch` - downloads the current synoptic chart and satellite images
//!   from the BOM website into a local directory, overwriting by file name.
//!
//! ## Build
//!
//! `station_ingest` is a Rust program and must be built from source using a
//! [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! git clone git@github.com:56quarters/station_ingest.git && cd station_ingest
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Polling the logger
//!
//! The poller needs the logger's address, the name of the data table to read,
//! and HTTP basic auth credentials. Credentials are read from the
//! `CAMPBELL_USER` and `CAMPBELL_PASSWORD` environment variables (a `.env`
//! file in the working directory is honored) and the process exits immediately
//! if either is missing.
//!
//! ```text
//! ./station_ingest --logger-url http://10.100.17.162/ --table ClimaVue_10Sec
//! ```
//!
//! Each polling cycle makes at most `--max-retries` attempts separated by
//! `--retry-delay-secs`, then waits `--poll-secs` for the next cycle whether or
//! not a record was fetched. Pass `--forward-url http://host:8080/post` to send
//! records to the listener instead of printing them.
//!
//! ### Receiving records into Postgres
//!
//! The listener reads its connection parameters from the conventional
//! `PGHOST`, `PGDATABASE`, `PGUSER`, `PGPASSWORD`, and `PGPORT` environment
//! variables, fetches the target table's column names once at startup, and
//! then accepts `POST /post` requests. Payload keys that don't match a column
//! are dropped; payloads with no matching keys at all are rejected.
//!
//! ```text
//! ./station_listener --bind 0.0.0.0:8080 --table setup_test
//! ```
//!
//! ### Fetching weather charts
//!
//! ```text
//! ./chart_fetch --save-dir bom_images
//! ```
//!
//! Both daemons shut down cleanly on SIGTERM or SIGINT.
//!

pub mod charts;
pub mod client;
pub mod ingest;
pub mod poll;

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

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashSet;
use std::env;
use std::error;
use std::fmt;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Logger field names that don't match their database column. Keys are
/// compared after lower-casing, before the allow-list filter.
const KEY_ALIASES: &[(&str, &str)] = &[
    ("battv", "batt_v"),
    ("ptemp", "ptemp_c"),
    ("vaporpr", "vp"),
    ("winddir", "wind_dir"),
    ("ws", "wind_speed"),
];

const VP_COLUMN: &str = "vp";
const DEWPOINT_COLUMN: &str = "dewpoint";
const STAMP_COLUMN: &str = "ts";

#[derive(Debug)]
pub enum IngestError {
    Payload(String),
    NoMatchingColumns,
    Database(sqlx::Error),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Payload(reason) => write!(f, "invalid payload: {}", reason),
            Self::NoMatchingColumns => write!(f, "no payload keys match any table column"),
            Self::Database(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for IngestError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Database(e) => Some(e),
            _ => None,
        }
    }
}

/// Database connection parameters, read once at startup from the
/// conventional `PG*` environment variables.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub port: u16,
}

impl DbConfig {
    pub fn from_env() -> Result<Self, String> {
        let host = env::var("PGHOST").map_err(|_| "PGHOST must be set".to_owned())?;
        let database = env::var("PGDATABASE").map_err(|_| "PGDATABASE must be set".to_owned())?;
        let user = env::var("PGUSER").map_err(|_| "PGUSER must be set".to_owned())?;
        let password = env::var("PGPASSWORD").map_err(|_| "PGPASSWORD must be set".to_owned())?;
        let port = match env::var("PGPORT") {
            Ok(raw) => raw.parse().map_err(|_| format!("invalid PGPORT {:?}", raw))?,
            Err(_) => 5432,
        };

        Ok(DbConfig {
            host,
            database,
            user,
            password,
            port,
        })
    }
}

pub async fn connect(config: &DbConfig) -> Result<PgPool, sqlx::Error> {
    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .database(&config.database)
        .username(&config.user)
        .password(&config.password);

    PgPoolOptions::new().max_connections(4).connect_with(options).await
}

/// Fetch the column allow-list for the target table. Done once at startup;
/// the set is immutable for the process lifetime.
pub async fn table_columns(pool: &PgPool, table: &str) -> Result<HashSet<String>, sqlx::Error> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT column_name::text FROM information_schema.columns WHERE table_name = $1",
    )
    .bind(table)
    .fetch_all(pool)
    .await?;

    Ok(names.into_iter().collect())
}

pub fn translate_key(key: &str) -> String {
    let lowered = key.to_ascii_lowercase();
    for (alias, column) in KEY_ALIASES {
        if lowered == *alias {
            return (*column).to_owned();
        }
    }

    lowered
}

/// Parse a comma separated `key=value` payload into translated keys and
/// float values. Any pair without a `=` or with a non-numeric value rejects
/// the whole payload.
pub fn parse_payload(raw: &str) -> Result<Vec<(String, f64)>, IngestError> {
    let mut parsed = Vec::new();
    for pair in raw.trim().split(',') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| IngestError::Payload(format!("expected key=value, got {:?}", pair)))?;
        let value = value
            .trim()
            .parse::<f64>()
            .map_err(|_| IngestError::Payload(format!("non-numeric value for {}: {:?}", key, value)))?;

        parsed.push((translate_key(key.trim()), value));
    }

    Ok(parsed)
}

/// Dewpoint in degrees celsius from vapor pressure in millibars, via the
/// inverted Magnus formula.
pub fn dewpoint_from_vapor_pressure(vp_mbar: f64) -> f64 {
    let gamma = (vp_mbar / 6.112).ln();
    243.5 * gamma / (17.67 - gamma)
}

/// A row ready to insert: readings that survived the allow-list filter plus
/// the optional UTC stamp.
#[derive(Debug)]
pub struct InsertRow {
    pub readings: Vec<(String, f64)>,
    pub stamp: Option<DateTime<Utc>>,
}

/// Turn a raw payload into an insertable row against the given column
/// allow-list.
///
/// Keys are lower-cased and alias-translated before filtering. If nothing
/// survives the filter the payload is rejected outright. A `dewpoint`
/// column is derived from vapor pressure when the payload didn't provide
/// one, and a `ts` column is stamped with the current UTC time.
pub fn prepare_row(raw: &str, columns: &HashSet<String>) -> Result<InsertRow, IngestError> {
    let parsed = parse_payload(raw)?;

    let vapor_pressure = parsed.iter().find(|(key, _)| key == VP_COLUMN).map(|(_, v)| *v);

    let mut readings = parsed
        .into_iter()
        .filter(|(key, _)| columns.contains(key))
        .collect::<Vec<_>>();

    if readings.is_empty() {
        return Err(IngestError::NoMatchingColumns);
    }

    if columns.contains(DEWPOINT_COLUMN) && !readings.iter().any(|(key, _)| key == DEWPOINT_COLUMN) {
        if let Some(vp) = vapor_pressure {
            readings.push((DEWPOINT_COLUMN.to_owned(), dewpoint_from_vapor_pressure(vp)));
        }
    }

    let stamp = columns.contains(STAMP_COLUMN).then(Utc::now);

    Ok(InsertRow { readings, stamp })
}

/// Insert one row into the target table.
///
/// Column names come from the allow-list fetched out of
/// `information_schema`, never from the payload, so they are pushed as SQL
/// directly while values are bound.
pub async fn insert_row(pool: &PgPool, table: &str, row: &InsertRow) -> Result<(), sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO ");
    builder.push(table).push(" (");

    let mut columns = builder.separated(", ");
    for (name, _) in &row.readings {
        columns.push(name.as_str());
    }
    if row.stamp.is_some() {
        columns.push(STAMP_COLUMN);
    }

    builder.push(") VALUES (");
    let mut values = builder.separated(", ");
    for (_, value) in &row.readings {
        values.push_bind(*value);
    }
    if let Some(stamp) = row.stamp {
        values.push_bind(stamp);
    }
    builder.push(")");

    builder.build().execute(pool).await?;
    Ok(())
}

#[derive(Debug)]
pub struct AppState {
    pub pool: PgPool,
    pub table: String,
    pub columns: HashSet<String>,
}

#[derive(Serialize, Debug)]
pub struct PostResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    inserted: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl PostResponse {
    fn ok(inserted: usize) -> Self {
        PostResponse {
            status: "ok",
            inserted: Some(inserted),
            message: None,
        }
    }

    fn error<S: Into<String>>(message: S) -> Self {
        PostResponse {
            status: "error",
            inserted: None,
            message: Some(message.into()),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/post", post(receive_record))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn receive_record(
    State(state): State<Arc<AppState>>,
    body: String,
) -> (StatusCode, Json<PostResponse>) {
    tracing::debug!(message = "received logger payload", payload = %body);

    let row = match prepare_row(&body, &state.columns) {
        Ok(row) => row,
        Err(e) => {
            let status = match e {
                IngestError::Payload(_) => StatusCode::BAD_REQUEST,
                IngestError::NoMatchingColumns => StatusCode::UNPROCESSABLE_ENTITY,
                IngestError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::warn!(message = "rejected payload", payload = %body, error = %e);
            return (status, Json(PostResponse::error(e.to_string())));
        }
    };

    match insert_row(&state.pool, &state.table, &row).await {
        Ok(()) => {
            tracing::info!(
                message = "inserted record",
                table = %state.table,
                columns = row.readings.len(),
            );
            (StatusCode::OK, Json(PostResponse::ok(row.readings.len())))
        }
        Err(e) => {
            tracing::error!(message = "database insert failed", table = %state.table, error = %e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PostResponse::error(e.to_string())),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{dewpoint_from_vapor_pressure, parse_payload, prepare_row, IngestError};
    use std::collections::HashSet;

    fn columns(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| (*n).to_owned()).collect()
    }

    #[test]
    fn test_parse_payload_translates_keys() {
        let parsed = parse_payload("BattV=13.2,VaporPr=8.5,rh=63").unwrap();

        assert_eq!(
            vec![
                ("batt_v".to_owned(), 13.2),
                ("vp".to_owned(), 8.5),
                ("rh".to_owned(), 63.0),
            ],
            parsed
        );
    }

    #[test]
    fn test_parse_payload_missing_separator() {
        let err = parse_payload("batt_v=13.2,garbage").unwrap_err();
        assert!(matches!(err, IngestError::Payload(_)), "{}", err);
    }

    #[test]
    fn test_parse_payload_non_numeric_value() {
        let err = parse_payload("batt_v=high").unwrap_err();
        assert!(matches!(err, IngestError::Payload(_)), "{}", err);
    }

    #[test]
    fn test_parse_payload_empty() {
        assert!(parse_payload("").is_err());
    }

    #[test]
    fn test_prepare_row_filters_unknown_keys() {
        let row = prepare_row("batt_v=13.2,foo=99", &columns(&["batt_v", "ts"])).unwrap();

        assert_eq!(vec![("batt_v".to_owned(), 13.2)], row.readings);
        assert!(row.stamp.is_some());
    }

    #[test]
    fn test_prepare_row_no_matching_columns() {
        let err = prepare_row("foo=1,bar=2", &columns(&["batt_v"])).unwrap_err();
        assert!(matches!(err, IngestError::NoMatchingColumns), "{}", err);
    }

    #[test]
    fn test_prepare_row_no_stamp_without_ts_column() {
        let row = prepare_row("batt_v=13.2", &columns(&["batt_v"])).unwrap();
        assert!(row.stamp.is_none());
    }

    #[test]
    fn test_prepare_row_derives_dewpoint() {
        let row = prepare_row("VaporPr=12.27", &columns(&["vp", "dewpoint"])).unwrap();

        let dewpoint = row
            .readings
            .iter()
            .find(|(key, _)| key == "dewpoint")
            .map(|(_, v)| *v)
            .unwrap();
        assert!((dewpoint - 10.0).abs() < 0.1, "dewpoint was {}", dewpoint);
    }

    #[test]
    fn test_prepare_row_keeps_explicit_dewpoint() {
        let row = prepare_row("VaporPr=12.27,dewpoint=4.5", &columns(&["vp", "dewpoint"])).unwrap();

        let dewpoints = row
            .readings
            .iter()
            .filter(|(key, _)| key == "dewpoint")
            .map(|(_, v)| *v)
            .collect::<Vec<_>>();
        assert_eq!(vec![4.5], dewpoints);
    }

    #[test]
    fn test_dewpoint_at_saturation_reference() {
        // ln(6.112 / 6.112) = 0, so the dewpoint is exactly 0 C
        assert!(dewpoint_from_vapor_pressure(6.112).abs() < 1e-9);
    }

    #[test]
    fn test_dewpoint_monotonic_in_vapor_pressure() {
        assert!(dewpoint_from_vapor_pressure(20.0) > dewpoint_from_vapor_pressure(10.0));
        assert!(dewpoint_from_vapor_pressure(3.0) < 0.0);
    }
}

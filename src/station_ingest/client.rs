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

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error;
use std::fmt;

#[derive(Debug)]
pub enum ClientError {
    Transport(reqwest::Error),
    Unexpected(StatusCode, Url),
    Malformed(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::Unexpected(status, url) => write!(f, "unexpected status {} for {}", status, url),
            Self::Malformed(reason) => write!(f, "malformed response: {}", reason),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Client for the query API exposed by a Campbell datalogger over HTTP.
///
/// All requests use HTTP basic auth with the credentials the logger was
/// provisioned with and are subject to whatever timeout the underlying
/// `reqwest::Client` was built with.
#[derive(Debug)]
pub struct CsapiClient {
    client: Client,
    base_url: Url,
    username: String,
    password: String,
}

impl CsapiClient {
    pub fn new(client: Client, base_url: Url, username: &str, password: &str) -> Self {
        CsapiClient {
            client,
            base_url,
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }

    /// Fetch the single newest record of the named data table and normalize
    /// it into a `PollResult`.
    ///
    /// Transport failures, non-200 responses, and bodies that don't decode
    /// into the expected `head`/`data` shape are all distinct error kinds so
    /// callers can tell network problems from protocol problems.
    pub async fn most_recent(&self, table: &str) -> Result<PollResult, ClientError> {
        let url = self.query_url(table);
        tracing::debug!(message = "making most-recent data query", url = %url);

        let res = self
            .client
            .get(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(ClientError::Transport)?;

        let status = res.status();
        if status != StatusCode::OK {
            return Err(ClientError::Unexpected(status, url));
        }

        let body = res.text().await.map_err(ClientError::Transport)?;
        let parsed = serde_json::from_str::<DataQueryResponse>(&body)
            .map_err(|e| ClientError::Malformed(e.to_string()))?;

        PollResult::from_response(parsed)
    }

    fn query_url(&self, table: &str) -> Url {
        let encoded_table = utf8_percent_encode(table, NON_ALPHANUMERIC);
        let mut url = self.base_url.clone();
        {
            url.path_segments_mut()
                .map(|mut p| {
                    p.clear().push("csapi").push("");
                })
                .expect("unable to modify query URL path segments");
        }
        url.set_query(Some(&format!(
            "command=DataQuery&mode=most-recent&format=json&uri=dl:{}&p1=1",
            encoded_table
        )));

        url
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct DataQueryResponse {
    #[serde(alias = "head")]
    pub head: Head,
    #[serde(alias = "data")]
    pub data: Vec<Record>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Head {
    #[serde(alias = "fields")]
    pub fields: Vec<Field>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Field {
    #[serde(alias = "name")]
    pub name: String,
    #[serde(alias = "type")]
    pub type_: Option<String>,
    #[serde(alias = "units")]
    pub units: Option<String>,
    #[serde(alias = "process")]
    pub process: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Record {
    #[serde(alias = "time")]
    pub time: String,
    #[serde(alias = "no")]
    pub no: u64,
    #[serde(alias = "vals")]
    pub vals: Vec<f64>,
}

/// One normalized record from the logger: the timestamp and sequence number
/// as reported, plus a name to value mapping built by pairing the table's
/// field names against the record's values positionally.
#[derive(Serialize, Debug)]
pub struct PollResult {
    pub timestamp: String,
    pub sequence_number: u64,
    pub readings: BTreeMap<String, f64>,
}

impl PollResult {
    /// Normalize a decoded query response into a `PollResult` from its
    /// newest record. The field list and value list must pair up exactly,
    /// with no duplicate field names, otherwise the response is malformed.
    pub fn from_response(res: DataQueryResponse) -> Result<Self, ClientError> {
        let num_fields = res.head.fields.len();
        let record = res
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Malformed("response contains no records".to_owned()))?;

        if num_fields != record.vals.len() {
            return Err(ClientError::Malformed(format!(
                "{} fields but {} values",
                num_fields,
                record.vals.len()
            )));
        }

        let readings = res
            .head
            .fields
            .into_iter()
            .map(|f| f.name)
            .zip(record.vals)
            .collect::<BTreeMap<String, f64>>();

        if readings.len() != num_fields {
            return Err(ClientError::Malformed("duplicate field names".to_owned()));
        }

        Ok(PollResult {
            timestamp: record.time,
            sequence_number: record.no,
            readings,
        })
    }

    /// Render the readings as the comma separated `key=value` form that the
    /// listener's POST endpoint accepts.
    pub fn to_payload(&self) -> String {
        self.readings
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::{DataQueryResponse, PollResult};

    const RESPONSE: &str = r#"{
        "head": {
            "fields": [
                {"name": "BattV", "type": "xsd:float", "units": "Volts", "process": "Smp"},
                {"name": "AirT_C", "type": "xsd:float", "units": "Deg C", "process": "Smp"},
                {"name": "RH", "type": "xsd:float", "units": "%", "process": "Smp"}
            ]
        },
        "data": [
            {"time": "2024-05-01T10:00:00", "no": 1207, "vals": [13.2, 21.5, 63.0]}
        ]
    }"#;

    fn decode(body: &str) -> DataQueryResponse {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_from_response_pairs_fields_and_values() {
        let result = PollResult::from_response(decode(RESPONSE)).unwrap();

        assert_eq!("2024-05-01T10:00:00", result.timestamp);
        assert_eq!(1207, result.sequence_number);
        assert_eq!(3, result.readings.len());
        assert_eq!(Some(&13.2), result.readings.get("BattV"));
        assert_eq!(Some(&21.5), result.readings.get("AirT_C"));
        assert_eq!(Some(&63.0), result.readings.get("RH"));
    }

    #[test]
    fn test_from_response_only_newest_record() {
        let body = r#"{
            "head": {"fields": [{"name": "BattV"}]},
            "data": [
                {"time": "2024-05-01T10:00:10", "no": 1208, "vals": [13.3]},
                {"time": "2024-05-01T10:00:00", "no": 1207, "vals": [13.2]}
            ]
        }"#;

        let result = PollResult::from_response(decode(body)).unwrap();
        assert_eq!(1208, result.sequence_number);
        assert_eq!(Some(&13.3), result.readings.get("BattV"));
    }

    #[test]
    fn test_from_response_length_mismatch() {
        let body = r#"{
            "head": {"fields": [{"name": "BattV"}, {"name": "AirT_C"}]},
            "data": [{"time": "2024-05-01T10:00:00", "no": 1207, "vals": [13.2]}]
        }"#;

        let err = PollResult::from_response(decode(body)).unwrap_err();
        assert!(err.to_string().contains("2 fields but 1 values"), "{}", err);
    }

    #[test]
    fn test_from_response_empty_records() {
        let body = r#"{
            "head": {"fields": [{"name": "BattV"}]},
            "data": []
        }"#;

        let err = PollResult::from_response(decode(body)).unwrap_err();
        assert!(err.to_string().contains("no records"), "{}", err);
    }

    #[test]
    fn test_from_response_duplicate_field_names() {
        let body = r#"{
            "head": {"fields": [{"name": "BattV"}, {"name": "BattV"}]},
            "data": [{"time": "2024-05-01T10:00:00", "no": 1207, "vals": [13.2, 13.3]}]
        }"#;

        let err = PollResult::from_response(decode(body)).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{}", err);
    }

    #[test]
    fn test_decode_missing_keys() {
        let body = r#"{"data": [{"time": "2024-05-01T10:00:00", "no": 1207, "vals": []}]}"#;
        assert!(serde_json::from_str::<DataQueryResponse>(body).is_err());
    }

    #[test]
    fn test_decode_non_numeric_value() {
        let body = r#"{
            "head": {"fields": [{"name": "BattV"}]},
            "data": [{"time": "2024-05-01T10:00:00", "no": 1207, "vals": ["NAN"]}]
        }"#;
        assert!(serde_json::from_str::<DataQueryResponse>(body).is_err());
    }

    #[test]
    fn test_to_payload() {
        let result = PollResult::from_response(decode(RESPONSE)).unwrap();
        assert_eq!("AirT_C=21.5,BattV=13.2,RH=63", result.to_payload());
    }
}

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

use crate::client::{CsapiClient, PollResult};
use reqwest::{Client, StatusCode, Url};
use std::error;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Knobs for the polling loop, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub table: String,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

#[derive(Debug)]
pub enum SinkError {
    Transport(reqwest::Error),
    Rejected(StatusCode, Url),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::Rejected(status, url) => write!(f, "record rejected with status {} by {}", status, url),
        }
    }
}

impl error::Error for SinkError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Where each cycle's normalized record goes: pretty-printed to standard
/// output, or POSTed to the listener as a `key=value` payload.
#[derive(Debug)]
pub enum RecordSink {
    Console,
    Forward { client: Client, url: Url },
}

impl RecordSink {
    pub async fn emit(&self, record: &PollResult) -> Result<(), SinkError> {
        match self {
            Self::Console => {
                let rendered =
                    serde_json::to_string_pretty(record).expect("PollResult serializes to JSON");
                println!("{}", rendered);
                Ok(())
            }
            Self::Forward { client, url } => {
                let res = client
                    .post(url.clone())
                    .body(record.to_payload())
                    .send()
                    .await
                    .map_err(SinkError::Transport)?;

                let status = res.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(SinkError::Rejected(status, url.clone()))
                }
            }
        }
    }
}

/// Polls the logger for the most recent record on a fixed interval, retrying
/// a bounded number of times within each cycle before giving up until the
/// next one.
#[derive(Debug)]
pub struct Poller {
    client: CsapiClient,
    config: PollerConfig,
    sink: RecordSink,
}

impl Poller {
    pub fn new(client: CsapiClient, config: PollerConfig, sink: RecordSink) -> Self {
        Poller { client, config, sink }
    }

    /// Run one polling cycle: up to `max_retries` attempts separated by
    /// `retry_delay`, stopping at the first success. Returns `None` when
    /// every attempt failed; errors never escape a cycle.
    pub async fn poll_once(&self) -> Option<PollResult> {
        for attempt in 1..=self.config.max_retries {
            match self.client.most_recent(&self.config.table).await {
                Ok(result) => {
                    tracing::info!(
                        message = "fetched most recent record",
                        attempt = attempt,
                        sequence_number = result.sequence_number,
                        timestamp = %result.timestamp,
                    );
                    return Some(result);
                }
                Err(e) => {
                    tracing::warn!(
                        message = "poll attempt failed",
                        attempt = attempt,
                        max_retries = self.config.max_retries,
                        error = %e,
                    );
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        tracing::error!(
            message = "max retries reached, will try again next poll",
            max_retries = self.config.max_retries,
        );
        None
    }

    /// Poll until the shutdown signal fires. The signal is honored during
    /// the inter-cycle wait, not mid-cycle.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    tracing::info!("shutdown signal received, polling stopped");
                    return;
                }
            }

            if let Some(result) = self.poll_once().await {
                if let Err(e) = self.sink.emit(&result).await {
                    tracing::error!(message = "failed to emit record", error = %e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Poller, PollerConfig, RecordSink};
    use crate::client::CsapiClient;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use reqwest::{Client, Url};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    const RESPONSE: &str = r#"{
        "head": {"fields": [{"name": "BattV"}, {"name": "AirT_C"}]},
        "data": [{"time": "2024-05-01T10:00:00", "no": 42, "vals": [13.2, 21.5]}]
    }"#;

    #[derive(Clone)]
    struct StubState {
        hits: Arc<AtomicUsize>,
        fail_first: usize,
    }

    async fn stub_query(State(state): State<StubState>) -> (StatusCode, String) {
        let hit = state.hits.fetch_add(1, Ordering::SeqCst);
        if hit < state.fail_first {
            (StatusCode::SERVICE_UNAVAILABLE, "busy".to_owned())
        } else {
            (StatusCode::OK, RESPONSE.to_owned())
        }
    }

    fn spawn_stub(fail_first: usize) -> (SocketAddr, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let state = StubState {
            hits: Arc::clone(&hits),
            fail_first,
        };
        let app = Router::new().route("/csapi/", get(stub_query)).with_state(state);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service())
                .await
                .unwrap();
        });

        (addr, hits)
    }

    fn poller_for(addr: SocketAddr, max_retries: u32) -> Poller {
        let base_url = Url::parse(&format!("http://{}/", addr)).unwrap();
        let client = CsapiClient::new(Client::new(), base_url, "admin", "secret");
        let config = PollerConfig {
            table: "ClimaVue_10Sec".to_owned(),
            poll_interval: Duration::from_millis(20),
            max_retries,
            retry_delay: Duration::from_millis(5),
        };

        Poller::new(client, config, RecordSink::Console)
    }

    #[tokio::test]
    async fn test_poll_once_first_attempt() {
        let (addr, hits) = spawn_stub(0);
        let poller = poller_for(addr, 5);

        let result = poller.poll_once().await.unwrap();

        assert_eq!(42, result.sequence_number);
        assert_eq!(2, result.readings.len());
        assert_eq!(Some(&13.2), result.readings.get("BattV"));
        assert_eq!(1, hits.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_poll_once_succeeds_on_last_attempt() {
        let (addr, hits) = spawn_stub(4);
        let poller = poller_for(addr, 5);

        let result = poller.poll_once().await.unwrap();

        assert_eq!(42, result.sequence_number);
        assert_eq!(5, hits.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_poll_once_exhausts_retries() {
        let (addr, hits) = spawn_stub(usize::MAX);
        let poller = poller_for(addr, 3);

        assert!(poller.poll_once().await.is_none());
        assert_eq!(3, hits.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_honors_shutdown() {
        let (addr, _hits) = spawn_stub(0);
        let poller = Arc::new(poller_for(addr, 1));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let poller = Arc::clone(&poller);
            async move { poller.run(rx).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller did not stop after shutdown signal")
            .unwrap();
    }
}

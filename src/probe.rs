//! Polls the bridge's pairing endpoint until it can present a QR code.
//!
//! The bridge's startup latency is small and roughly constant, so a fixed
//! short cadence converges quickly; no backoff needed.

use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default overall budget for the pairing endpoint to become ready.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(90);

/// Default pause between readiness samples.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);

/// One readiness sample of the pairing endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrProbeResult {
    /// The endpoint can present a scannable code.
    pub ready: bool,
    /// Pairing URI carried in the response, when the bridge includes one.
    pub pairing_uri: Option<String>,
}

/// Final outcome of a bounded readiness poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// A presentable code appeared after `elapsed`.
    Ready {
        elapsed: Duration,
        pairing_uri: Option<String>,
    },
    /// The budget elapsed without the endpoint becoming ready.
    NotReady,
    /// The backing container stopped mid-poll; waiting further is pointless.
    Aborted,
}

pub struct QrProber {
    client: Client,
    max_wait: Duration,
    interval: Duration,
}

impl QrProber {
    pub fn new() -> Self {
        Self::with_timing(DEFAULT_MAX_WAIT, DEFAULT_INTERVAL)
    }

    pub fn with_timing(max_wait: Duration, interval: Duration) -> Self {
        Self {
            client: Client::new(),
            max_wait,
            interval,
        }
    }

    /// Poll `url` at a fixed cadence until it reports a presentable code,
    /// the budget elapses, or `container_alive` observes the container gone.
    /// An abort returns immediately without waiting out the remaining budget.
    pub async fn poll(&self, url: &str, container_alive: impl Fn() -> bool) -> ReadinessOutcome {
        let started = Instant::now();
        loop {
            if !container_alive() {
                debug!("bridge container stopped after {:?}", started.elapsed());
                return ReadinessOutcome::Aborted;
            }

            let sample = self.sample(url).await;
            if sample.ready {
                return ReadinessOutcome::Ready {
                    elapsed: started.elapsed(),
                    pairing_uri: sample.pairing_uri,
                };
            }

            if started.elapsed() >= self.max_wait {
                return ReadinessOutcome::NotReady;
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One request against the pairing endpoint. Transport errors count as
    /// not-ready; the bridge is likely still booting.
    async fn sample(&self, url: &str) -> QrProbeResult {
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("pairing endpoint not reachable yet: {}", e);
                return QrProbeResult {
                    ready: false,
                    pairing_uri: None,
                };
            }
        };

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.bytes().await.unwrap_or_default();
        classify(&content_type, &String::from_utf8_lossy(&body))
    }
}

impl Default for QrProber {
    fn default() -> Self {
        Self::new()
    }
}

/// An image content type means the code is presentable. The body may also
/// carry a `sgnl://` pairing URI to render out of band.
fn classify(content_type: &str, body: &str) -> QrProbeResult {
    if content_type.starts_with("image/") {
        QrProbeResult {
            ready: true,
            pairing_uri: extract_pairing_uri(body),
        }
    } else {
        QrProbeResult {
            ready: false,
            pairing_uri: None,
        }
    }
}

/// Pull a `sgnl://` device-link URI out of a response body, if one exists.
pub fn extract_pairing_uri(body: &str) -> Option<String> {
    let start = body.find("sgnl://")?;
    let rest = &body[start..];
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '"' || c.is_control())
        .unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

//! Network capacity probe.
//!
//! Downloads a small set of known endpoints, measures aggregate throughput,
//! and maps it onto discrete levels that size the fetch pool. The default
//! level-to-concurrency mapping (2/5/10/5) can be overridden with the
//! `network.concurrency_override` setting.

use std::time::{Duration, Instant};

/// Probe endpoints: small, highly available documents.
const DEFAULT_ENDPOINTS: &[&str] = &[
    "https://www.gstatic.com/generate_204",
    "https://www.cloudflare.com/cdn-cgi/trace",
    "https://httpbin.org/bytes/65536",
];

/// Per-endpoint probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Throughput thresholds in bytes/second. Defaults, not physics.
const SLOW_BELOW: f64 = 256.0 * 1024.0;
const MEDIUM_BELOW: f64 = 2048.0 * 1024.0;

/// Discrete capacity level with its fetch-pool concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkLevel {
    Slow,
    Medium,
    Fast,
    Unknown,
}

impl NetworkLevel {
    /// Fetch-pool size for this level.
    pub fn concurrency(self) -> usize {
        match self {
            NetworkLevel::Slow => 2,
            NetworkLevel::Medium => 5,
            NetworkLevel::Fast => 10,
            NetworkLevel::Unknown => 5,
        }
    }
}

/// Probe the default endpoints.
pub async fn measure(client: &reqwest::Client) -> NetworkLevel {
    measure_endpoints(client, DEFAULT_ENDPOINTS).await
}

/// Probe a specific endpoint set (tests use a local mock server).
pub async fn measure_endpoints(client: &reqwest::Client, endpoints: &[&str]) -> NetworkLevel {
    let mut total_bytes: usize = 0;
    let mut total_elapsed = Duration::ZERO;

    for endpoint in endpoints {
        let started = Instant::now();
        let result = tokio::time::timeout(PROBE_TIMEOUT, async {
            let response = client.get(*endpoint).send().await?;
            let body = response.bytes().await?;
            Ok::<usize, reqwest::Error>(body.len())
        })
        .await;

        match result {
            Ok(Ok(len)) => {
                total_bytes += len;
                total_elapsed += started.elapsed();
            }
            Ok(Err(e)) => {
                tracing::debug!(endpoint = endpoint, error = %e, "Probe endpoint failed");
            }
            Err(_) => {
                tracing::debug!(endpoint = endpoint, "Probe endpoint timed out");
                total_elapsed += PROBE_TIMEOUT;
            }
        }
    }

    if total_bytes == 0 || total_elapsed.is_zero() {
        return NetworkLevel::Unknown;
    }

    let throughput = total_bytes as f64 / total_elapsed.as_secs_f64();
    let level = if throughput < SLOW_BELOW {
        NetworkLevel::Slow
    } else if throughput < MEDIUM_BELOW {
        NetworkLevel::Medium
    } else {
        NetworkLevel::Fast
    };

    tracing::info!(
        bytes = total_bytes,
        throughput_kbps = (throughput / 1024.0) as u64,
        level = ?level,
        "Bandwidth probe complete"
    );
    level
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_level_concurrency_mapping() {
        assert_eq!(NetworkLevel::Slow.concurrency(), 2);
        assert_eq!(NetworkLevel::Medium.concurrency(), 5);
        assert_eq!(NetworkLevel::Fast.concurrency(), 10);
        assert_eq!(NetworkLevel::Unknown.concurrency(), 5);
    }

    #[tokio::test]
    async fn test_unreachable_endpoints_give_unknown() {
        let client = reqwest::Client::new();
        let level = measure_endpoints(&client, &["http://127.0.0.1:1/nothing"]).await;
        assert_eq!(level, NetworkLevel::Unknown);
    }

    #[tokio::test]
    async fn test_local_server_measures_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 1024 * 1024]))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/blob", server.uri());
        let level = measure_endpoints(&client, &[url.as_str()]).await;
        // Loopback transfers of 1 MiB land far above the fast threshold.
        assert_eq!(level, NetworkLevel::Fast);
    }

    #[tokio::test]
    async fn test_slow_server_measures_slow() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 10 * 1024])
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/blob", server.uri());
        let level = measure_endpoints(&client, &[url.as_str()]).await;
        assert_eq!(level, NetworkLevel::Slow);
    }
}

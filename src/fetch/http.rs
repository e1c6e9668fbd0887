//! Deadline-governed HTTP fetch used by the standard and XPath feed kinds.
//!
//! Contract: the first attempt gets 5 s to the first byte and 10 s total;
//! on timeout, transport error, or a truncated body there is exactly one
//! retry (after a short settle delay) with a flat 10 s budget. Bodies are
//! size-capped as they stream and checked against Content-Length so a
//! partial transfer is retried, not silently parsed as a short feed.

use futures::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::FetchError;

/// First-byte deadline for the initial attempt.
const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(5);
/// Total wall-clock budget per attempt.
const TOTAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Response body cap; feeds larger than this are junk or abuse.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;
/// Pause before the single retry, so a blip has a moment to clear.
const RETRY_SETTLE: Duration = Duration::from_millis(250);

/// Fetch a URL with the retry contract above. Cancellation is observed
/// between and during attempts.
pub async fn fetch_bytes(
    client: &reqwest::Client,
    url: &str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, FetchError> {
    match attempt(client, url, cancel, true).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.is_retryable() => {
            tracing::debug!(url = %url, error = %e, "Retrying fetch after transport failure");
            tokio::select! {
                _ = tokio::time::sleep(RETRY_SETTLE) => {}
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            }
            attempt(client, url, cancel, false).await
        }
        Err(e) => Err(e),
    }
}

async fn attempt(
    client: &reqwest::Client,
    url: &str,
    cancel: &CancellationToken,
    first: bool,
) -> Result<Vec<u8>, FetchError> {
    if cancel.is_cancelled() {
        return Err(FetchError::Cancelled);
    }

    let work = async {
        let send = client.get(url).send();
        let response = if first {
            // 5 s to response headers (first byte) on the initial attempt.
            tokio::time::timeout(FIRST_BYTE_TIMEOUT, send)
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(|e| FetchError::Transport(e.to_string()))?
        } else {
            send.await.map_err(|e| FetchError::Transport(e.to_string()))?
        };

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        read_body_capped(response, MAX_BODY_SIZE).await
    };

    let deadline = tokio::time::timeout(TOTAL_TIMEOUT, work);

    tokio::select! {
        result = deadline => result.map_err(|_| FetchError::Timeout)?,
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
    }
}

/// Stream the body against a shrinking byte budget.
///
/// The cap is enforced per chunk as data arrives (an oversized declared
/// Content-Length never reads a byte), and a body shorter than declared is
/// reported as [`FetchError::IncompleteResponse`] — which is retryable, so
/// an interrupted transfer gets the same second chance as a refused
/// connection.
async fn read_body_capped(response: reqwest::Response, cap: usize) -> Result<Vec<u8>, FetchError> {
    let declared = response.content_length();
    if declared.is_some_and(|len| len > cap as u64) {
        return Err(FetchError::ResponseTooLarge);
    }

    let mut body = declared
        .map(|len| Vec::with_capacity(len as usize))
        .unwrap_or_default();
    let mut budget = cap;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::Transport(e.to_string()))?;
        budget = budget
            .checked_sub(chunk.len())
            .ok_or(FetchError::ResponseTooLarge)?;
        body.extend_from_slice(&chunk);
    }

    match declared {
        Some(expected) if (body.len() as u64) < expected => Err(FetchError::IncompleteResponse {
            expected,
            received: body.len(),
        }),
        _ => Ok(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("payload"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        let bytes = fetch_bytes(&client, &format!("{}/feed", server.uri()), &cancel)
            .await
            .unwrap();
        assert_eq!(bytes, b"payload");
    }

    #[tokio::test]
    async fn test_http_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1) // no retry for status errors
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        let err = fetch_bytes(&client, &format!("{}/feed", server.uri()), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)));
    }

    #[tokio::test]
    async fn test_transport_error_retried_once() {
        // Nothing listens on this port: both attempts fail at connect.
        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        let err = fetch_bytes(&client, "http://127.0.0.1:1/feed", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let server = MockServer::start().await;
        let body = vec![b'x'; MAX_BODY_SIZE + 1];
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        let err = fetch_bytes(&client, &format!("{}/feed", server.uri()), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ResponseTooLarge));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fetch_bytes(&client, "http://127.0.0.1:1/feed", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let cancel = CancellationToken::new();
        let start = std::time::Instant::now();
        let err = fetch_bytes(&client, &format!("{}/feed", server.uri()), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout));
        // First attempt 5 s to first byte + one retry within 10 s total.
        assert!(start.elapsed() < Duration::from_secs(25));
    }
}

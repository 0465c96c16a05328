use crate::transport::{parse_endpoint, TransportError};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

pub const LATENCY_TIMEOUT: Duration = Duration::from_secs(2);
pub const LATENCY_SAMPLES: usize = 5;

/// Approximate an HTTP server's network latency: send concurrent HEAD requests
/// to the endpoint and keep the fastest time to response headers.
///
/// Fails only when every sample failed.
pub async fn probe_http(endpoint: &str) -> Result<Duration, TransportError> {
    let (url, _mode) = parse_endpoint(endpoint)?;
    let client = reqwest::Client::builder()
        .timeout(LATENCY_TIMEOUT)
        .build()
        .map_err(|e| TransportError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

    let mut samples = JoinSet::new();
    for _ in 0..LATENCY_SAMPLES {
        let request = client.head(url.clone());
        samples.spawn(async move {
            let start = Instant::now();
            request.send().await.map(|_| start.elapsed())
        });
    }

    let mut min_latency: Option<Duration> = None;
    let mut last_err = None;
    while let Some(joined) = samples.join_next().await {
        match joined {
            Ok(Ok(latency)) => {
                if min_latency.map_or(true, |min| latency < min) {
                    min_latency = Some(latency);
                }
            }
            Ok(Err(e)) => last_err = Some(TransportError::from_reqwest(e, LATENCY_TIMEOUT)),
            Err(e) => {
                last_err = Some(TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    match (min_latency, last_err) {
        (Some(latency), _) => Ok(latency),
        (None, Some(err)) => Err(err),
        (None, None) => Err(TransportError::Timeout(LATENCY_TIMEOUT)),
    }
}

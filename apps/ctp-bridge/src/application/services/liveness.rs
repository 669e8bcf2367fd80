//! Liveness Probe
//!
//! Sends a cheap no-op request straight through the correlator, bypassing
//! tier admission and session gating, and succeeds on the first terminal
//! frame with `error_code == 0`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;

use super::correlation::Correlator;

/// Probe settings.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Method used as the ping.
    pub method: String,
    /// Timeout of each attempt.
    pub timeout: Duration,
    /// Attempts before giving up.
    pub attempts: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            method: "ReqQryTradingAccount".to_string(),
            timeout: Duration::from_millis(2000),
            attempts: 3,
        }
    }
}

/// Successful probe.
#[derive(Debug, Clone, Serialize)]
pub struct LivenessReport {
    /// Attempt that succeeded (1-based).
    pub attempt: u32,
    /// Round trip of that attempt in milliseconds.
    pub latency_ms: u64,
}

/// Probe failure.
#[derive(Debug, thiserror::Error)]
#[error("engine liveness check failed after {attempts} attempts: {last_error}")]
pub struct LivenessError {
    /// Attempts made.
    pub attempts: u32,
    /// Failure of the last attempt.
    pub last_error: String,
}

/// Engine liveness probe.
#[derive(Clone)]
pub struct LivenessProbe {
    correlator: Arc<Correlator>,
    config: LivenessConfig,
}

impl LivenessProbe {
    /// Probe over `correlator`.
    #[must_use]
    pub const fn new(correlator: Arc<Correlator>, config: LivenessConfig) -> Self {
        Self { correlator, config }
    }

    /// Run up to `attempts` pings.
    ///
    /// # Errors
    ///
    /// Returns `LivenessError` if no attempt saw a successful terminal frame.
    pub async fn check(&self) -> Result<LivenessReport, LivenessError> {
        let attempts = self.config.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let started = Instant::now();
            let result = match self
                .correlator
                .send_with_timeout(&self.config.method, json!({}), self.config.timeout)
                .await
            {
                Ok(stream) => stream.terminal().await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match result {
                Ok(frame) if frame.res.as_ref().is_some_and(|res| res.error_code == 0) => {
                    let latency_ms =
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    tracing::debug!(attempt, latency_ms, "Liveness ping answered");
                    return Ok(LivenessReport {
                        attempt,
                        latency_ms,
                    });
                }
                Ok(frame) => {
                    last_error = frame
                        .res
                        .map(|res| format!("engine returned {} {}", res.error_code, res.error_message))
                        .unwrap_or_default();
                }
                Err(e) => last_error = e,
            }
            tracing::warn!(attempt, attempts, error = %last_error, "Liveness ping failed");
        }

        Err(LivenessError {
            attempts,
            last_error,
        })
    }
}

impl std::fmt::Debug for LivenessProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessProbe")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{RestartReason, RestartSignal};
    use crate::domain::frame::{Frame, ResponseBody};
    use crate::infrastructure::transport::{ChannelTransport, EnginePeer};

    struct NoRestart;

    impl RestartSignal for NoRestart {
        fn request_restart(&self, _reason: RestartReason) -> bool {
            false
        }
    }

    fn probe(timeout: Duration, attempts: u32) -> (LivenessProbe, Arc<Correlator>, EnginePeer) {
        let (transport, _inbound, peer) = ChannelTransport::pair(8);
        let correlator = Arc::new(Correlator::new(
            Arc::new(transport),
            Arc::new(NoRestart),
            Duration::from_secs(5),
        ));
        let config = LivenessConfig {
            method: "ReqQryTradingAccount".to_string(),
            timeout,
            attempts,
        };
        (
            LivenessProbe::new(Arc::clone(&correlator), config),
            correlator,
            peer,
        )
    }

    #[tokio::test]
    async fn answered_ping_is_alive() {
        let (probe, correlator, mut peer) = probe(Duration::from_secs(1), 3);
        let check = tokio::spawn(async move { probe.check().await });

        let ping = peer.next_request().await.unwrap();
        assert_eq!(ping.method(), Some("ReqQryTradingAccount"));
        correlator.dispatch(&Frame::response(
            ping.request_id,
            ResponseBody::ok("OnRspQryTradingAccount", None, true),
        ));

        let report = check.await.unwrap().unwrap();
        assert_eq!(report.attempt, 1);
    }

    #[tokio::test]
    async fn business_error_is_retried() {
        let (probe, correlator, mut peer) = probe(Duration::from_secs(1), 3);
        let check = tokio::spawn(async move { probe.check().await });

        let first = peer.next_request().await.unwrap();
        correlator.dispatch(&Frame::response(
            first.request_id,
            ResponseBody::error("OnRspQryTradingAccount", 90, "query in progress"),
        ));
        let second = peer.next_request().await.unwrap();
        correlator.dispatch(&Frame::response(
            second.request_id,
            ResponseBody::ok("OnRspQryTradingAccount", None, true),
        ));

        let report = check.await.unwrap().unwrap();
        assert_eq!(report.attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_engine_fails_after_every_attempt() {
        let (probe, correlator, mut peer) = probe(Duration::from_millis(100), 2);

        let err = probe.check().await.unwrap_err();
        assert_eq!(err.attempts, 2);
        assert!(err.last_error.contains("timed out"));
        assert!(peer.try_next_request().is_some());
        assert!(peer.try_next_request().is_some());
        assert_eq!(correlator.in_flight(), 0);
    }
}

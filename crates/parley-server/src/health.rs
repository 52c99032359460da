//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

/// `/health` body.
#[derive(Clone, Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server answers.
    pub status: &'static str,
    /// Seconds since the server was built.
    pub uptime_secs: u64,
    /// Pairs currently reachable by a notification.
    pub correlations: usize,
    /// Whether inbound notifications can be verified at all.
    pub webhook_secret_configured: bool,
}

/// Assemble the health body.
pub fn health_check(start_time: Instant, correlations: usize, webhook_secret_configured: bool) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_secs: start_time.elapsed().as_secs(),
        correlations,
        webhook_secret_configured,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reports_uptime_and_counts() {
        let start = Instant::now().checked_sub(Duration::from_secs(60)).unwrap();
        let resp = health_check(start, 3, true);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs >= 59);
        assert_eq!(resp.correlations, 3);

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["webhook_secret_configured"], true);
    }
}

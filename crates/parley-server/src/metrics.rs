//! Webhook receiver metrics.

use metrics_exporter_prometheus::PrometheusHandle;

/// Notifications received (counter, labels: result).
pub const NOTIFICATIONS_TOTAL: &str = "parley_notifications_total";
/// Notification handling time (histogram).
pub const NOTIFICATION_DURATION_SECONDS: &str = "parley_notification_duration_seconds";
/// Outcomes published with no subscriber listening (counter).
pub const BROADCAST_UNOBSERVED_TOTAL: &str = "parley_broadcast_unobserved_total";

/// Prometheus text exposition, or an empty body when no recorder is wired.
pub fn render(handle: Option<&PrometheusHandle>) -> String {
    handle.map(PrometheusHandle::render).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn render_without_recorder_is_empty() {
        assert!(render(None).is_empty());
    }

    #[test]
    fn render_with_detached_recorder() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(Some(&handle));
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn names_are_prefixed_snake_case() {
        for name in [NOTIFICATIONS_TOTAL, NOTIFICATION_DURATION_SECONDS, BROADCAST_UNOBSERVED_TOTAL] {
            assert!(name.starts_with("parley_"));
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}

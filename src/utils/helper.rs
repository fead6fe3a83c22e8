/// Alert operations team (critical). Used for manipulation-grade price
/// deviations.
pub fn alert_operations_team_critical(message: String) {
    tracing::error!(target: "oracle::alerts", severity = "critical", "CRITICAL ALERT: {}", message);
}

/// Alert operations team (warning)
pub fn alert_operations_team_warning(message: String) {
    tracing::warn!(target: "oracle::alerts", severity = "warning", "WARNING ALERT: {}", message);
}

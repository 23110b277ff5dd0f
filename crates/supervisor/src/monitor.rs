//! Threshold alerts over delivery and run health

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub metric_name: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub threshold: f64,
    pub current_value: f64,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThreshold {
    pub metric_name: String,
    #[serde(default)]
    pub info: Option<f64>,
    pub warning: f64,
    pub critical: f64,
}

impl AlertThreshold {
    pub fn new(metric_name: impl Into<String>, warning: f64, critical: f64) -> Self {
        Self {
            metric_name: metric_name.into(),
            info: None,
            warning,
            critical,
        }
    }

    /// Most severe level crossed by `value`, with the threshold crossed
    pub fn classify(&self, value: f64) -> Option<(AlertSeverity, f64)> {
        if value >= self.critical {
            Some((AlertSeverity::Critical, self.critical))
        } else if value >= self.warning {
            Some((AlertSeverity::Warning, self.warning))
        } else {
            self.info
                .filter(|info| value >= *info)
                .map(|info| (AlertSeverity::Info, info))
        }
    }
}

pub fn default_thresholds() -> Vec<AlertThreshold> {
    vec![
        AlertThreshold::new("send_failure_rate", 0.05, 0.20),
        AlertThreshold::new("run_failure_rate", 0.10, 0.30),
        AlertThreshold {
            metric_name: "active_connections".to_string(),
            info: Some(500.0),
            warning: 1000.0,
            critical: 5000.0,
        },
    ]
}

/// Holds at most one unresolved alert per metric
#[derive(Debug)]
pub struct AlertMonitor {
    thresholds: Vec<AlertThreshold>,
    alerts: RwLock<Vec<Alert>>,
}

impl Default for AlertMonitor {
    fn default() -> Self {
        Self::new(default_thresholds())
    }
}

impl AlertMonitor {
    pub fn new(thresholds: Vec<AlertThreshold>) -> Self {
        Self {
            thresholds,
            alerts: RwLock::new(Vec::new()),
        }
    }

    pub fn thresholds(&self) -> &[AlertThreshold] {
        &self.thresholds
    }

    /// Check a metric reading. Returns the new alert if one was raised.
    pub async fn evaluate(&self, metric_name: &str, current_value: f64) -> Option<Alert> {
        let threshold = self
            .thresholds
            .iter()
            .find(|t| t.metric_name == metric_name)?;
        let (severity, crossed) = threshold.classify(current_value)?;

        let mut alerts = self.alerts.write().await;
        if alerts
            .iter()
            .any(|alert| alert.metric_name == metric_name && !alert.resolved)
        {
            return None;
        }

        let alert = Alert {
            metric_name: metric_name.to_string(),
            severity,
            message: format!(
                "{} is {:.3}, at or above the {:?} threshold of {:.3}",
                metric_name, current_value, severity, crossed
            ),
            threshold: crossed,
            current_value,
            timestamp: Utc::now(),
            resolved: false,
            resolved_at: None,
        };
        alerts.push(alert.clone());

        match severity {
            AlertSeverity::Critical => tracing::error!("[ALERTS] {}", alert.message),
            AlertSeverity::Warning => tracing::warn!("[ALERTS] {}", alert.message),
            AlertSeverity::Info => tracing::info!("[ALERTS] {}", alert.message),
        }
        Some(alert)
    }

    /// Resolve the active alert for a metric. Returns false if none was active.
    pub async fn resolve(&self, metric_name: &str) -> bool {
        let mut alerts = self.alerts.write().await;
        match alerts
            .iter_mut()
            .find(|alert| alert.metric_name == metric_name && !alert.resolved)
        {
            Some(alert) => {
                alert.resolved = true;
                alert.resolved_at = Some(Utc::now());
                tracing::info!("[ALERTS] Resolved alert for {}", metric_name);
                true
            }
            None => false,
        }
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .read()
            .await
            .iter()
            .filter(|alert| !alert.resolved)
            .cloned()
            .collect()
    }

    pub async fn all_alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }

    /// Drop resolved alerts and any older than `retention`
    pub async fn sweep(&self, retention: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(retention) {
            Ok(retention) => Utc::now() - retention,
            Err(_) => return 0,
        };

        let mut alerts = self.alerts.write().await;
        let before = alerts.len();
        alerts.retain(|alert| !alert.resolved && alert.timestamp >= cutoff);
        before - alerts.len()
    }
}

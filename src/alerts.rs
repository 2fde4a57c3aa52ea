//! Threshold-based alerting over metric samples.
//!
//! An alert fires once when a metric crosses its threshold and resolves
//! once it drops back under; repeated samples above the threshold do not
//! re-trigger.

use crate::metrics::{now_millis, SystemMetrics};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    CpuHigh,
    MemoryHigh,
    DiskHigh,
    NetworkHigh,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::CpuHigh => "CPU_HIGH",
            AlertKind::MemoryHigh => "MEMORY_HIGH",
            AlertKind::DiskHigh => "DISK_HIGH",
            AlertKind::NetworkHigh => "NETWORK_HIGH",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    pub threshold: f64,
    pub current_value: f64,
    pub timestamp: u64,
}

impl Alert {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

pub type AlertCallback = Box<dyn Fn(&Alert) + Send + Sync>;

struct Thresholds {
    cpu: f64,
    memory: f64,
    disk: f64,
    /// Combined rx+tx rate in bytes per second.
    network: f64,
}

pub struct AlertManager {
    thresholds: Mutex<Thresholds>,
    active: Mutex<HashMap<AlertKind, Alert>>,
    callback: Mutex<Option<AlertCallback>>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self {
            thresholds: Mutex::new(Thresholds {
                cpu: 80.0,
                memory: 85.0,
                disk: 90.0,
                network: 100.0 * 1024.0 * 1024.0,
            }),
            active: Mutex::new(HashMap::new()),
            callback: Mutex::new(None),
        }
    }

    pub fn set_cpu_threshold(&self, percent: f64) {
        self.thresholds.lock().unwrap().cpu = percent;
    }

    pub fn set_memory_threshold(&self, percent: f64) {
        self.thresholds.lock().unwrap().memory = percent;
    }

    pub fn set_disk_threshold(&self, percent: f64) {
        self.thresholds.lock().unwrap().disk = percent;
    }

    pub fn set_network_threshold(&self, bytes_per_second: f64) {
        self.thresholds.lock().unwrap().network = bytes_per_second;
    }

    pub fn set_alert_callback<F>(&self, callback: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        *self.callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Evaluate one sample against the thresholds.
    pub fn check_metrics(&self, metrics: &SystemMetrics) {
        let (cpu, memory, disk, network) = {
            let t = self.thresholds.lock().unwrap();
            (t.cpu, t.memory, t.disk, t.network)
        };

        self.evaluate(
            AlertKind::CpuHigh,
            "CPU usage is high",
            metrics.cpu.percent,
            cpu,
        );
        self.evaluate(
            AlertKind::MemoryHigh,
            "Memory usage is high",
            metrics.memory.percent,
            memory,
        );
        self.evaluate(
            AlertKind::DiskHigh,
            "Disk usage is high",
            metrics.disk.percent,
            disk,
        );
        self.evaluate(
            AlertKind::NetworkHigh,
            "Network throughput is high",
            metrics.network.rx_rate + metrics.network.tx_rate,
            network,
        );
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.active.lock().unwrap().values().cloned().collect();
        alerts.sort_by_key(|a| a.timestamp);
        alerts
    }

    pub fn is_alert_active(&self, kind: AlertKind) -> bool {
        self.active.lock().unwrap().contains_key(&kind)
    }

    fn evaluate(&self, kind: AlertKind, message: &str, current: f64, threshold: f64) {
        if current > threshold {
            let mut active = self.active.lock().unwrap();
            if active.contains_key(&kind) {
                return;
            }
            let alert = Alert {
                kind,
                message: message.to_string(),
                threshold,
                current_value: current,
                timestamp: now_millis(),
            };
            active.insert(kind, alert.clone());
            drop(active);

            tracing::warn!(
                kind = kind.as_str(),
                current,
                threshold,
                "alert triggered"
            );
            if let Some(cb) = self.callback.lock().unwrap().as_ref() {
                cb(&alert);
            }
        } else if self.active.lock().unwrap().remove(&kind).is_some() {
            tracing::info!(kind = kind.as_str(), current, "alert resolved");
        }
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{CpuMetrics, NetworkMetrics};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sample_with_cpu(percent: f64) -> SystemMetrics {
        SystemMetrics {
            cpu: CpuMetrics {
                percent,
                ..CpuMetrics::default()
            },
            ..SystemMetrics::default()
        }
    }

    #[test]
    fn triggers_once_and_resolves() {
        let manager = AlertManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        manager.set_alert_callback(move |alert| {
            assert_eq!(alert.kind, AlertKind::CpuHigh);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.check_metrics(&sample_with_cpu(95.0));
        manager.check_metrics(&sample_with_cpu(97.0));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(manager.is_alert_active(AlertKind::CpuHigh));

        manager.check_metrics(&sample_with_cpu(10.0));
        assert!(!manager.is_alert_active(AlertKind::CpuHigh));

        // Crossing again re-triggers.
        manager.check_metrics(&sample_with_cpu(90.0));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn threshold_is_exclusive() {
        let manager = AlertManager::new();
        manager.set_cpu_threshold(50.0);
        manager.check_metrics(&sample_with_cpu(50.0));
        assert!(!manager.is_alert_active(AlertKind::CpuHigh));
        manager.check_metrics(&sample_with_cpu(50.1));
        assert!(manager.is_alert_active(AlertKind::CpuHigh));
    }

    #[test]
    fn network_alert_uses_combined_rate() {
        let manager = AlertManager::new();
        manager.set_network_threshold(1000.0);

        let sample = SystemMetrics {
            network: NetworkMetrics {
                rx_rate: 600.0,
                tx_rate: 600.0,
                ..NetworkMetrics::default()
            },
            ..SystemMetrics::default()
        };
        manager.check_metrics(&sample);
        assert!(manager.is_alert_active(AlertKind::NetworkHigh));
    }

    #[test]
    fn alert_serializes_with_type_tag() {
        let alert = Alert {
            kind: AlertKind::DiskHigh,
            message: "Disk usage is high".to_string(),
            threshold: 90.0,
            current_value: 93.5,
            timestamp: 1,
        };
        let json = alert.to_json();
        assert!(json.contains("\"type\":\"DISK_HIGH\""));
        assert!(json.contains("\"current_value\":93.5"));
    }
}

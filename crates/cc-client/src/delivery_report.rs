//! Per-message delivery reports: an in-memory, FIFO-capped
//! history of delivery attempts, useful for diagnostics and UI surfacing.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeliveryAttempt {
    pub timestamp: DateTime<Utc>,
    pub presence_check: bool,
    pub endpoint: String,
    pub http_status: Option<u16>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeliveryReport {
    pub message_id: Uuid,
    pub attempts: Vec<DeliveryAttempt>,
    pub final_status: Option<String>,
}

pub struct DeliveryReports {
    cap: usize,
    order: Mutex<VecDeque<Uuid>>,
    reports: Mutex<HashMap<Uuid, DeliveryReport>>,
}

impl DeliveryReports {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            order: Mutex::new(VecDeque::new()),
            reports: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, message_id: Uuid, attempt: DeliveryAttempt) {
        let mut reports = self.reports.lock();
        let mut order = self.order.lock();
        if !reports.contains_key(&message_id) {
            order.push_back(message_id);
            while order.len() > self.cap {
                if let Some(evicted) = order.pop_front() {
                    reports.remove(&evicted);
                }
            }
            reports.insert(
                message_id,
                DeliveryReport {
                    message_id,
                    attempts: Vec::new(),
                    final_status: None,
                },
            );
        }
        if let Some(report) = reports.get_mut(&message_id) {
            report.attempts.push(attempt);
        }
    }

    pub fn set_final_status(&self, message_id: Uuid, status: impl Into<String>) {
        if let Some(report) = self.reports.lock().get_mut(&message_id) {
            report.final_status = Some(status.into());
        }
    }

    pub fn get(&self, message_id: &Uuid) -> Option<DeliveryReport> {
        self.reports.lock().get(message_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_reports_at_capacity_with_fifo_eviction() {
        let reports = DeliveryReports::new(2);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            reports.record(
                *id,
                DeliveryAttempt {
                    timestamp: Utc::now(),
                    presence_check: true,
                    endpoint: "https://peer".into(),
                    http_status: Some(200),
                    error: None,
                    duration_ms: 5,
                },
            );
        }
        assert_eq!(reports.len(), 2);
        assert!(reports.get(&ids[0]).is_none());
        assert!(reports.get(&ids[2]).is_some());
    }
}

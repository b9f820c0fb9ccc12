use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A time-stamped metric observation routed to the trigger engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub monitorer: String,
    pub identifier: String,
    pub metrics: BTreeMap<String, serde_json::Value>,
}

/// Raw queue statistics as reported by a RabbitMQ-style management API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    #[serde(default)]
    pub messages_ready: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_stats: Option<MessageStats>,
    #[serde(default)]
    pub consumers: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_details: Option<RateDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_details: Option<RateDetail>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateDetail {
    #[serde(default)]
    pub rate: f64,
}

/// Normalized queue metrics published as a metric sample.
///
/// `rate` is deliver minus publish: positive means the queue is draining,
/// negative means it is falling behind. `latency` is how long a message
/// waits given the current deliver rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub exists: bool,
    pub waiting: u64,
    pub latency: Option<f64>,
    pub rate: Option<f64>,
    pub call_rate: f64,
    pub exec_rate: f64,
    pub consumers: u64,
}

impl QueueMetrics {
    /// Shape reported for a queue that does not exist.
    pub fn absent() -> Self {
        Self {
            exists: false,
            waiting: 0,
            latency: None,
            rate: None,
            call_rate: 0.0,
            exec_rate: 0.0,
            consumers: 0,
        }
    }

    pub fn from_stats(stats: &QueueStats) -> Self {
        let (call_rate, exec_rate, rate, latency) = match &stats.message_stats {
            None => (0.0, 0.0, None, None),
            Some(message_stats) => {
                let publish = message_stats
                    .publish_details
                    .as_ref()
                    .map(|d| d.rate)
                    .unwrap_or(0.0);
                let deliver = message_stats
                    .deliver_details
                    .as_ref()
                    .map(|d| d.rate)
                    .unwrap_or(0.0);
                let latency = if deliver > 0.0 {
                    Some(stats.messages_ready as f64 / deliver)
                } else {
                    None
                };
                (publish, deliver, Some(deliver - publish), latency)
            }
        };
        Self {
            exists: true,
            waiting: stats.messages_ready,
            latency,
            rate,
            call_rate,
            exec_rate,
            consumers: stats.consumers,
        }
    }

    /// Flatten into the generic metric map carried by a sample.
    pub fn to_metric_map(&self) -> BTreeMap<String, serde_json::Value> {
        let value = serde_json::to_value(self).expect("queue metrics serialize");
        match value {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => unreachable!("queue metrics serialize to an object"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_active_queue() {
        let stats: QueueStats = serde_json::from_value(serde_json::json!({
            "messages_ready": 0,
            "message_stats": {
                "publish_details": {"rate": 269.2},
                "deliver_details": {"rate": 270.6}
            },
            "consumers": 1
        }))
        .unwrap();

        let metrics = QueueMetrics::from_stats(&stats);
        assert!(metrics.exists);
        assert_eq!(metrics.waiting, 0);
        assert_eq!(metrics.latency, Some(0.0));
        assert_eq!(metrics.call_rate, 269.2);
        assert_eq!(metrics.exec_rate, 270.6);
        assert_eq!(metrics.consumers, 1);
        let rate = metrics.rate.unwrap();
        assert!((rate - 1.4).abs() < 1e-9);
    }

    #[test]
    fn test_compute_never_used_queue() {
        let stats = QueueStats {
            messages_ready: 0,
            message_stats: None,
            consumers: 0,
        };
        let metrics = QueueMetrics::from_stats(&stats);
        assert!(metrics.exists);
        assert_eq!(metrics.latency, None);
        assert_eq!(metrics.rate, None);
        assert_eq!(metrics.call_rate, 0.0);
        assert_eq!(metrics.exec_rate, 0.0);
    }

    #[test]
    fn test_compute_stalled_queue() {
        // messages waiting but nothing delivering: latency is unknown
        let stats: QueueStats = serde_json::from_value(serde_json::json!({
            "messages_ready": 12,
            "message_stats": {
                "publish_details": {"rate": 3.0},
                "deliver_details": {"rate": 0.0}
            },
            "consumers": 0
        }))
        .unwrap();
        let metrics = QueueMetrics::from_stats(&stats);
        assert_eq!(metrics.latency, None);
        assert_eq!(metrics.rate, Some(-3.0));
    }

    #[test]
    fn test_absent_queue() {
        let metrics = QueueMetrics::absent();
        assert!(!metrics.exists);
        assert_eq!(metrics.waiting, 0);
        assert_eq!(metrics.consumers, 0);
    }

    #[test]
    fn test_metric_map() {
        let map = QueueMetrics::absent().to_metric_map();
        assert_eq!(map["exists"], serde_json::json!(false));
        assert_eq!(map["latency"], serde_json::Value::Null);
        assert_eq!(map["waiting"], serde_json::json!(0));
    }
}

// src/tests/metrics_tests.rs

use std::time::Duration;

use crate::metrics::{MetricPoint, MetricType, MetricsCollector, MetricsFilter};

#[test]
fn test_ring_buffer_evicts_oldest_on_overflow() {
    let collector = MetricsCollector::new(1000, 16);

    for i in 0..1500 {
        collector.add_metric(
            MetricPoint::request("llm", i as f64, true).with_extra("index", i.to_string()),
        );
    }

    let points = collector.get_recent(&MetricsFilter::default());
    assert_eq!(points.len(), 1000);

    // The most recent 1000 points, in insertion order
    assert_eq!(points[0].extra.get("index").unwrap(), "500");
    assert_eq!(points[999].extra.get("index").unwrap(), "1499");
}

#[test]
fn test_get_recent_filters_by_dependency_and_type() {
    let collector = MetricsCollector::new(100, 16);

    collector.add_metric(MetricPoint::request("llm", 120.0, true));
    collector.add_metric(MetricPoint::request("news", 80.0, false));
    collector.add_metric(MetricPoint::health_check("llm", 30.0, true));

    let llm_only = collector.get_recent(&MetricsFilter {
        dependency: Some("llm".to_string()),
        ..MetricsFilter::default()
    });
    assert_eq!(llm_only.len(), 2);

    let requests_only = collector.get_recent(&MetricsFilter {
        metric_type: Some(MetricType::Request),
        ..MetricsFilter::default()
    });
    assert_eq!(requests_only.len(), 2);

    let llm_requests = collector.get_recent(&MetricsFilter {
        dependency: Some("llm".to_string()),
        metric_type: Some(MetricType::Request),
        ..MetricsFilter::default()
    });
    assert_eq!(llm_requests.len(), 1);
    assert_eq!(llm_requests[0].value, 120.0);
}

#[test]
fn test_get_recent_limit_keeps_newest() {
    let collector = MetricsCollector::new(100, 16);
    for i in 0..10 {
        collector
            .add_metric(MetricPoint::request("llm", i as f64, true));
    }

    let points = collector.get_recent(&MetricsFilter {
        limit: Some(3),
        ..MetricsFilter::default()
    });
    assert_eq!(points.len(), 3);
    assert_eq!(points[0].value, 7.0);
    assert_eq!(points[2].value, 9.0);
}

#[tokio::test]
async fn test_subscribers_receive_points_in_order() {
    let collector = MetricsCollector::new(100, 16);
    let (_id, mut rx) = collector.subscribe();

    collector.add_metric(MetricPoint::request("llm", 1.0, true));
    collector.add_metric(MetricPoint::request("llm", 2.0, false));
    collector.add_metric(MetricPoint::request("llm", 3.0, true));

    assert_eq!(rx.recv().await.unwrap().value, 1.0);
    assert_eq!(rx.recv().await.unwrap().value, 2.0);
    assert_eq!(rx.recv().await.unwrap().value, 3.0);
}

#[tokio::test]
async fn test_slow_subscriber_is_dropped_not_blocked() {
    // Queue of 2 and a receiver that never reads: the third append must
    // drop the subscriber instead of blocking the producer
    let collector = MetricsCollector::new(100, 2);
    let (_id, _rx) = collector.subscribe();
    assert_eq!(collector.subscriber_count(), 1);

    collector.add_metric(MetricPoint::request("llm", 1.0, true));
    collector.add_metric(MetricPoint::request("llm", 2.0, true));
    assert_eq!(collector.subscriber_count(), 1);

    collector.add_metric(MetricPoint::request("llm", 3.0, true));
    assert_eq!(collector.subscriber_count(), 0);

    // The buffer itself kept everything
    assert_eq!(collector.get_recent(&MetricsFilter::default()).len(), 3);
}

#[tokio::test]
async fn test_unsubscribe_removes_subscriber() {
    let collector = MetricsCollector::new(100, 16);
    let (id, _rx) = collector.subscribe();
    let (_other_id, mut other_rx) = collector.subscribe();
    assert_eq!(collector.subscriber_count(), 2);

    collector.unsubscribe(id);
    assert_eq!(collector.subscriber_count(), 1);

    // The remaining subscriber still receives points
    collector.add_metric(MetricPoint::request("llm", 1.0, true));
    assert_eq!(other_rx.recv().await.unwrap().value, 1.0);
}

#[tokio::test]
async fn test_dropped_receiver_is_pruned_on_next_append() {
    let collector = MetricsCollector::new(100, 16);
    let (_id, rx) = collector.subscribe();
    drop(rx);

    collector.add_metric(MetricPoint::request("llm", 1.0, true));
    assert_eq!(collector.subscriber_count(), 0);
}

#[test]
fn test_summarize_aggregates_per_dependency() {
    let collector = MetricsCollector::new(100, 16);

    collector.add_metric(MetricPoint::request("llm", 100.0, true));
    collector.add_metric(MetricPoint::request("llm", 300.0, false));
    collector.add_metric(MetricPoint::request("news", 50.0, true));
    collector.add_metric(MetricPoint::health_check("news", 10.0, true));

    let summary = collector.summarize(Duration::from_secs(60));
    assert_eq!(summary.total_points, 4);

    let llm = summary.by_dependency.get("llm").unwrap();
    assert_eq!(llm.requests, 2);
    assert_eq!(llm.failures, 1);
    assert_eq!(llm.avg_response_time_ms, Some(200.0));

    let news = summary.by_dependency.get("news").unwrap();
    assert_eq!(news.requests, 1);
    assert_eq!(news.failures, 0);
    assert_eq!(
        news.count_by_type.get(&MetricType::HealthCheck).copied(),
        Some(1)
    );
}

use bitflipper::metrics::{register_metrics, render_metrics, CONNECTION_FAILURES};

#[test]
fn test_rendered_metrics_include_failure_kinds() {
    register_metrics();
    CONNECTION_FAILURES.with_label_values(&["timeout"]).inc();

    let text = render_metrics();
    assert!(text.contains("bitflipper_connection_failures_total{kind=\"timeout\"}"));
    assert!(text.contains("bitflipper_active_connections"));
}

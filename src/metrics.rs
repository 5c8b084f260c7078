use std::sync::LazyLock;
use std::time::Duration;

use prometheus::*;

static METRIC_SEARCH_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "cell_search_count",
        "count of the searches by strategy and metric",
        &["strategy", "metric"]
    )
    .unwrap()
});

static METRIC_SEARCH_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "cell_search_duration",
        "duration of the per-query search in seconds",
        &["strategy", "metric"]
    )
    .unwrap()
});

static METRIC_SEARCH_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("cell_search_failures", "count of the failed searches by error kind", &["kind"])
        .unwrap()
});

static METRIC_INDEX_REBUILDS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("cell_search_index_rebuilds", "count of the population index rebuilds").unwrap()
});

static METRIC_INDEX_REBUILD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "cell_search_index_rebuild_duration",
        "duration of the population index rebuild in seconds"
    )
    .unwrap()
});

/// 记录一次完成的搜索
pub fn observe_search(strategy: &str, metric: &str, duration: Duration) {
    METRIC_SEARCH_COUNT.with_label_values(&[strategy, metric]).inc();
    METRIC_SEARCH_DURATION.with_label_values(&[strategy, metric]).observe(duration.as_secs_f64());
}

pub fn inc_search_failure(kind: &str) {
    METRIC_SEARCH_FAILURES.with_label_values(&[kind]).inc();
}

pub fn observe_index_rebuild(duration: Duration) {
    METRIC_INDEX_REBUILDS.inc();
    METRIC_INDEX_REBUILD_DURATION.observe(duration.as_secs_f64());
}

/// 以 Prometheus 文本格式导出当前进程的全部指标
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&prometheus::gather()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported() {
        observe_search("scan", "euclidean", Duration::from_millis(3));
        inc_search_failure("validation");
        observe_index_rebuild(Duration::from_millis(10));
        let text = gather();
        assert!(text.contains("cell_search_count"));
        assert!(text.contains("cell_search_failures"));
        assert!(text.contains("cell_search_index_rebuilds"));
    }
}

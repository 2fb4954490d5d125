//! 延迟 / 错误计数统计
//!
//! 按 key 聚合 (如 `proxy:p1`、`worker:cam1`)，同时保留全量累计与最近
//! `window` 个样本的滚动统计。不做任何 I/O。

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

pub const DEFAULT_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    latency_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct Series {
    total: u64,
    errors: u64,
    latency_sum_ms: u64,
    last_latency_ms: Option<u64>,
    recent: VecDeque<Sample>,
}

/// 某个 key 的聚合视图
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SeriesStats {
    pub total: u64,
    pub errors: u64,
    pub last_latency_ms: Option<u64>,
    pub avg_latency_ms: Option<f64>,
    pub error_rate: f64,
    pub rolling_avg_latency_ms: Option<f64>,
    pub rolling_error_rate: f64,
}

#[derive(Debug)]
pub struct StatsCollector {
    window: usize,
    series: HashMap<String, Series>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl StatsCollector {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            series: HashMap::new(),
        }
    }

    pub fn record_success(&mut self, key: &str, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let window = self.window;
        let series = self.series.entry(key.to_string()).or_default();
        series.total += 1;
        series.latency_sum_ms += ms;
        series.last_latency_ms = Some(ms);
        push(&mut series.recent, window, Sample {
            success: true,
            latency_ms: Some(ms),
        });
    }

    pub fn record_failure(&mut self, key: &str) {
        let window = self.window;
        let series = self.series.entry(key.to_string()).or_default();
        series.total += 1;
        series.errors += 1;
        push(&mut series.recent, window, Sample {
            success: false,
            latency_ms: None,
        });
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<SeriesStats> {
        self.series.get(key).map(aggregate)
    }

    pub fn snapshot(&self) -> BTreeMap<String, SeriesStats> {
        self.series
            .iter()
            .map(|(k, s)| (k.clone(), aggregate(s)))
            .collect()
    }
}

fn push(recent: &mut VecDeque<Sample>, window: usize, sample: Sample) {
    if recent.len() == window {
        recent.pop_front();
    }
    recent.push_back(sample);
}

fn aggregate(s: &Series) -> SeriesStats {
    let successes = s.total - s.errors;
    let avg_latency_ms = (successes > 0).then(|| s.latency_sum_ms as f64 / successes as f64);
    let error_rate = if s.total == 0 {
        0.0
    } else {
        s.errors as f64 / s.total as f64
    };

    let latencies: Vec<u64> = s.recent.iter().filter_map(|r| r.latency_ms).collect();
    let rolling_avg_latency_ms = (!latencies.is_empty())
        .then(|| latencies.iter().sum::<u64>() as f64 / latencies.len() as f64);
    let recent_errors = s.recent.iter().filter(|r| !r.success).count();
    let rolling_error_rate = if s.recent.is_empty() {
        0.0
    } else {
        recent_errors as f64 / s.recent.len() as f64
    };

    SeriesStats {
        total: s.total,
        errors: s.errors,
        last_latency_ms: s.last_latency_ms,
        avg_latency_ms,
        error_rate,
        rolling_avg_latency_ms,
        rolling_error_rate,
    }
}

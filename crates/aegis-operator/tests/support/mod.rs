//! Shared fixtures for the end-to-end tests: a counting metrics recorder
//! and scripted scanners standing in for the external tools.

use aegis_common::{ScanOutcome, SecurityFinding, Severity};
use aegis_security::{FailMode, ScanContext, Scanner};
use async_trait::async_trait;
use metrics::{Counter, CounterFn, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

pub struct CounterCell(AtomicU64);

impl CounterFn for CounterCell {
    fn increment(&self, value: u64) {
        self.0.fetch_add(value, Ordering::SeqCst);
    }
    fn absolute(&self, value: u64) {
        self.0.store(value, Ordering::SeqCst);
    }
}

/// Global in-memory recorder so tests can assert on counter increments.
#[derive(Default)]
pub struct TestRecorder {
    counters: Mutex<HashMap<String, Arc<CounterCell>>>,
}

impl TestRecorder {
    fn register(&self, key: &Key) -> Arc<CounterCell> {
        let mut rendered = String::from(key.name());
        rendered.push('{');
        for (i, label) in key.labels().enumerate() {
            if i > 0 {
                rendered.push(',');
            }
            rendered.push_str(label.key());
            rendered.push('=');
            rendered.push_str(label.value());
        }
        rendered.push('}');
        self.counters
            .lock()
            .entry(rendered)
            .or_insert_with(|| Arc::new(CounterCell(AtomicU64::new(0))))
            .clone()
    }

    /// Sum of all counters with this name whose label set contains every
    /// `k=v` filter.
    pub fn counter_sum(&self, name: &str, label_filters: &[&str]) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|(key, _)| {
                key.starts_with(&format!("{}{{", name))
                    && label_filters.iter().all(|f| key.contains(f))
            })
            .map(|(_, cell)| cell.0.load(Ordering::SeqCst))
            .sum()
    }
}

struct RecorderHandle(&'static TestRecorder);

impl Recorder for RecorderHandle {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        Counter::from_arc(self.0.register(key))
    }

    fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}

/// Install (once per test binary) and return the counting recorder.
pub fn recorder() -> &'static TestRecorder {
    static RECORDER: OnceLock<&'static TestRecorder> = OnceLock::new();
    RECORDER.get_or_init(|| {
        let recorder: &'static TestRecorder = Box::leak(Box::new(TestRecorder::default()));
        let _ = metrics::set_global_recorder(RecorderHandle(recorder));
        recorder
    })
}

pub fn metric_delta(before: u64, after: u64) -> u64 {
    after.saturating_sub(before)
}

/// Image scanner double that always passes.
pub struct PassingImageScanner;

#[async_trait]
impl Scanner for PassingImageScanner {
    fn id(&self) -> &'static str {
        "image"
    }
    fn fail_mode(&self) -> FailMode {
        FailMode::Closed
    }
    fn should_run(&self, context: &ScanContext) -> bool {
        context.image.is_some()
    }
    async fn scan(&self, context: &ScanContext) -> ScanOutcome {
        ScanOutcome {
            tool: "image".to_string(),
            passed: true,
            skipped: false,
            reason: None,
            findings: vec![],
            summary: format!(
                "no vulnerabilities in {}",
                context.image.as_deref().unwrap_or("")
            ),
            raw: serde_json::Value::Null,
        }
    }
}

/// Image scanner double reporting one critical vulnerability.
pub struct BlockingImageScanner;

#[async_trait]
impl Scanner for BlockingImageScanner {
    fn id(&self) -> &'static str {
        "image"
    }
    fn fail_mode(&self) -> FailMode {
        FailMode::Closed
    }
    fn should_run(&self, context: &ScanContext) -> bool {
        context.image.is_some()
    }
    async fn scan(&self, context: &ScanContext) -> ScanOutcome {
        let image = context.image.clone().unwrap_or_default();
        ScanOutcome {
            tool: "image".to_string(),
            passed: false,
            skipped: false,
            reason: Some("1 critical vulnerability".to_string()),
            findings: vec![SecurityFinding {
                scanner: "image".to_string(),
                severity: Severity::Critical,
                title: "integer overflow in range filter".to_string(),
                identifier: "CVE-2017-7529".to_string(),
                location: image,
                raw: serde_json::Value::Null,
            }],
            summary: "critical vulnerability found".to_string(),
            raw: serde_json::Value::Null,
        }
    }
}

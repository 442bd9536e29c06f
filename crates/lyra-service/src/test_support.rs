//! Test doubles for exercising the service core without a transport: a
//! virtual clock, a recording metrics sink, and a scriptable controller.
//! These live in a normal module so integration suites can use them too.
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::controller::Controller;
use crate::metrics::MetricsSink;

/// Virtual clock advanced explicitly by tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ms: u64) {
        self.ms.store(ms, Ordering::Relaxed);
    }

    pub fn advance(&self, ms: u64) {
        self.ms.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::Relaxed)
    }
}

/// One emission captured by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Rate {
        name: String,
        value: u64,
        tags: Vec<(String, String)>,
    },
    GaugeDelta {
        name: String,
        delta: i64,
    },
    Histogram {
        name: String,
        value: f64,
        tags: Vec<(String, String)>,
    },
}

/// Sink that stores every emission for later assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn rate_total(&self, name: &str) -> u64 {
        self.events()
            .iter()
            .filter_map(|event| match event {
                MetricEvent::Rate { name: n, value, .. } if n == name => Some(*value),
                _ => None,
            })
            .sum()
    }

    pub fn rate_total_tagged(&self, name: &str, key: &str, value: &str) -> u64 {
        self.events()
            .iter()
            .filter_map(|event| match event {
                MetricEvent::Rate {
                    name: n,
                    value: v,
                    tags,
                } if n == name && tags.iter().any(|(k, tv)| k == key && tv == value) => Some(*v),
                _ => None,
            })
            .sum()
    }

    /// Net value of a gauge, i.e. the sum of its deltas.
    pub fn gauge_value(&self, name: &str) -> i64 {
        self.events()
            .iter()
            .filter_map(|event| match event {
                MetricEvent::GaugeDelta { name: n, delta } if n == name => Some(*delta),
                _ => None,
            })
            .sum()
    }

    pub fn histogram_values(&self, name: &str) -> Vec<f64> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                MetricEvent::Histogram { name: n, value, .. } if n == name => Some(*value),
                _ => None,
            })
            .collect()
    }
}

impl MetricsSink for RecordingSink {
    fn rate(&self, name: &str, value: u64, tags: &[(String, String)]) {
        self.events.lock().expect("events lock").push(MetricEvent::Rate {
            name: name.to_string(),
            value,
            tags: tags.to_vec(),
        });
    }

    fn gauge_delta(&self, name: &str, delta: i64) {
        self.events
            .lock()
            .expect("events lock")
            .push(MetricEvent::GaugeDelta {
                name: name.to_string(),
                delta,
            });
    }

    fn histogram(&self, name: &str, value: f64, tags: &[(String, String)]) {
        self.events
            .lock()
            .expect("events lock")
            .push(MetricEvent::Histogram {
                name: name.to_string(),
                value,
                tags: tags.to_vec(),
            });
    }
}

/// Shared state behind [`MockController`]; tests keep a clone to script
/// behavior and inspect what the core pushed.
#[derive(Debug)]
pub struct MockControllerState<Resp> {
    pushes: Mutex<Vec<Resp>>,
    can_push: AtomicBool,
    accept_push: AtomicBool,
    reads_paused: AtomicBool,
    graceful_closes: AtomicUsize,
}

impl<Resp> MockControllerState<Resp> {
    pub fn set_can_push(&self, value: bool) {
        self.can_push.store(value, Ordering::Relaxed);
    }

    /// Script `push` itself to refuse, independently of `can_push`.
    pub fn set_accept_push(&self, value: bool) {
        self.accept_push.store(value, Ordering::Relaxed);
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().expect("pushes lock").len()
    }

    pub fn reads_paused(&self) -> bool {
        self.reads_paused.load(Ordering::Relaxed)
    }

    pub fn graceful_closes(&self) -> usize {
        self.graceful_closes.load(Ordering::Relaxed)
    }
}

impl<Resp: Clone> MockControllerState<Resp> {
    pub fn pushes(&self) -> Vec<Resp> {
        self.pushes.lock().expect("pushes lock").clone()
    }
}

/// Controller double recording pushes; backpressure is scripted by tests.
#[derive(Debug)]
pub struct MockController<Resp> {
    state: Arc<MockControllerState<Resp>>,
}

impl<Resp> MockController<Resp> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockControllerState {
                pushes: Mutex::new(Vec::new()),
                can_push: AtomicBool::new(true),
                accept_push: AtomicBool::new(true),
                reads_paused: AtomicBool::new(false),
                graceful_closes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn state(&self) -> Arc<MockControllerState<Resp>> {
        Arc::clone(&self.state)
    }
}

impl<Resp> Default for MockController<Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Resp: Send> Controller<Resp> for MockController<Resp> {
    fn can_push(&self) -> bool {
        self.state.can_push.load(Ordering::Relaxed)
    }

    fn push(&mut self, response: Resp) -> bool {
        if !self.state.accept_push.load(Ordering::Relaxed) {
            return false;
        }
        self.state.pushes.lock().expect("pushes lock").push(response);
        true
    }

    fn pause_reads(&mut self) {
        self.state.reads_paused.store(true, Ordering::Relaxed);
    }

    fn close_gracefully(&mut self) {
        self.state.graceful_closes.fetch_add(1, Ordering::Relaxed);
    }
}

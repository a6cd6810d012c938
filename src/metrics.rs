#![forbid(unsafe_code)]

// Server metrics: lock-free counters and a fixed-bucket latency histogram,
// rendered in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Histogram upper bounds in microseconds, with their Prometheus labels
const BUCKETS: [(u64, &str); 8] = [
    (1_000, "0.001"),
    (5_000, "0.005"),
    (25_000, "0.025"),
    (100_000, "0.1"),
    (250_000, "0.25"),
    (1_000_000, "1"),
    (5_000_000, "5"),
    (10_000_000, "10"),
];

/// Monotonic counters exposed by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Connections,
    MessagesReceived,
    MessagesSent,
    Errors,
    Joins,
    RoomsCreated,
    RoomsClosed,
    TransportsCreated,
    ProducersCreated,
    ConsumersCreated,
}

impl Counter {
    const ALL: [Counter; 10] = [
        Counter::Connections,
        Counter::MessagesReceived,
        Counter::MessagesSent,
        Counter::Errors,
        Counter::Joins,
        Counter::RoomsCreated,
        Counter::RoomsClosed,
        Counter::TransportsCreated,
        Counter::ProducersCreated,
        Counter::ConsumersCreated,
    ];

    fn name(self) -> &'static str {
        match self {
            Counter::Connections => "liveclass_sfu_connections_total",
            Counter::MessagesReceived => "liveclass_sfu_messages_received_total",
            Counter::MessagesSent => "liveclass_sfu_messages_sent_total",
            Counter::Errors => "liveclass_sfu_errors_total",
            Counter::Joins => "liveclass_sfu_joins_total",
            Counter::RoomsCreated => "liveclass_sfu_rooms_created_total",
            Counter::RoomsClosed => "liveclass_sfu_rooms_closed_total",
            Counter::TransportsCreated => "liveclass_sfu_transports_created_total",
            Counter::ProducersCreated => "liveclass_sfu_producers_created_total",
            Counter::ConsumersCreated => "liveclass_sfu_consumers_created_total",
        }
    }

    fn help(self) -> &'static str {
        match self {
            Counter::Connections => "Signaling connections accepted",
            Counter::MessagesReceived => "Signaling messages received from peers",
            Counter::MessagesSent => "Signaling messages written to peers",
            Counter::Errors => "Error replies sent to peers",
            Counter::Joins => "Successful joins",
            Counter::RoomsCreated => "Rooms created",
            Counter::RoomsClosed => "Rooms closed by the controller",
            Counter::TransportsCreated => "WebRTC transports created",
            Counter::ProducersCreated => "Producers created",
            Counter::ConsumersCreated => "Consumers created",
        }
    }
}

/// Prometheus-compatible cumulative histogram
struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, (bound, _)) in self.buckets.iter().zip(BUCKETS.iter()) {
            if us <= *bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, (_, label)) in self.buckets.iter().zip(BUCKETS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

struct Inner {
    counters: [AtomicU64; Counter::ALL.len()],
    connections_active: AtomicU64,
    message_handling: Histogram,
}

/// Server-wide metrics, cheap to clone
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: std::array::from_fn(|_| AtomicU64::new(0)),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    fn slot(counter: Counter) -> usize {
        Counter::ALL.iter().position(|c| *c == counter).unwrap_or(0)
    }

    pub fn inc(&self, counter: Counter) {
        self.inner.counters[Self::slot(counter)].fetch_add(1, Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.inner.counters[Self::slot(counter)].load(Relaxed)
    }

    /// Marks a connection active until the guard is dropped
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inc(Counter::Connections);
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    pub fn connections_active(&self) -> u64 {
        self.inner.connections_active.load(Relaxed)
    }

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    /// `rooms_active` and `members_active` come from the room registry
    pub fn render_prometheus(&self, rooms_active: usize, members_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        for counter in Counter::ALL {
            render_metric(&mut out, counter.name(), counter.help(), "counter", self.get(counter));
        }

        render_metric(
            &mut out,
            "liveclass_sfu_connections_active",
            "Open signaling connections",
            "gauge",
            self.connections_active(),
        );
        render_metric(&mut out, "liveclass_sfu_rooms_active", "Rooms in the registry", "gauge", rooms_active as u64);
        render_metric(
            &mut out,
            "liveclass_sfu_room_members_active",
            "Peers joined to a room",
            "gauge",
            members_active as u64,
        );

        self.inner.message_handling.render(
            "liveclass_sfu_message_handling_seconds",
            "Signaling message handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// Decrements the active connection gauge on drop
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_metric(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

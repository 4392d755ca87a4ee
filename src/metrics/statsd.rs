//! statsd metrics aggregator.
//!
//! Samples are folded into in-memory maps and shipped once per epoch, so
//! the hot path never touches the network:
//! - counters are summed over the epoch
//! - timers and gauges keep the last recorded value
//!
//! Each metric is sent as its own UDP datagram in statsd line format:
//!
//! ```text
//! <prefix>.<name>:<value>|c
//! <prefix>.<name>:<value>|ms
//! <prefix>.<name>:<value>|g
//! ```

use super::{EpochCallback, Metrics};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

pub struct StatsdMetrics {
    socket: UdpSocket,
    prefix: String,
    counters: Mutex<HashMap<String, i64>>,
    timers: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, u64>>,
    epoch_calls: Mutex<Vec<EpochCallback>>,
}

impl StatsdMetrics {
    /// Open a UDP socket aimed at the statsd daemon at `addr`.
    pub async fn connect(addr: SocketAddr, prefix: &str) -> io::Result<Arc<Self>> {
        let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;

        info!(statsd = %addr, prefix, "Sending metrics to statsd");

        Ok(Arc::new(Self {
            socket,
            prefix: prefix.to_string(),
            counters: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            epoch_calls: Mutex::new(Vec::new()),
        }))
    }

    /// Flush aggregated metrics once per `period`, forever.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let sent = self.flush();
            trace!(sent, "Flushed metrics epoch");
        }
    }

    /// Run epoch callbacks, drain every map and send the results.
    ///
    /// Returns the number of datagrams handed to the socket.
    pub fn flush(&self) -> usize {
        for call in lock(&self.epoch_calls).iter() {
            call();
        }

        let counters = mem::take(&mut *lock(&self.counters));
        let timers = mem::take(&mut *lock(&self.timers));
        let gauges = mem::take(&mut *lock(&self.gauges));

        let mut sent = 0;
        for (name, value) in counters {
            sent += self.send(&name, value, "c");
        }
        for (name, value) in timers {
            sent += self.send(&name, value, "ms");
        }
        for (name, value) in gauges {
            sent += self.send(&name, value, "g");
        }
        sent
    }

    fn send(&self, name: &str, value: impl std::fmt::Display, kind: &str) -> usize {
        let line = format_line(&self.prefix, name, value, kind);
        match self.socket.try_send(line.as_bytes()) {
            Ok(_) => 1,
            Err(e) => {
                // A dropped datagram only loses one sample.
                debug!(metric = name, error = %e, "Failed to send metric");
                0
            }
        }
    }
}

impl Metrics for StatsdMetrics {
    fn counter(&self, name: &str, value: i64) {
        *lock(&self.counters).entry(name.to_string()).or_insert(0) += value;
    }

    fn timer(&self, name: &str, millis: u64) {
        lock(&self.timers).insert(name.to_string(), millis);
    }

    fn gauge(&self, name: &str, value: u64) {
        lock(&self.gauges).insert(name.to_string(), value);
    }

    fn on_epoch(&self, callback: EpochCallback) {
        lock(&self.epoch_calls).push(callback);
    }
}

fn format_line(prefix: &str, name: &str, value: impl std::fmt::Display, kind: &str) -> String {
    if prefix.is_empty() {
        format!("{name}:{value}|{kind}")
    } else {
        format!("{prefix}.{name}:{value}|{kind}")
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

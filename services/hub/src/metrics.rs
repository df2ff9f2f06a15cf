use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

/// In-process counters and gauges.
///
/// There is no export surface; tests and log lines read snapshots.
#[derive(Debug, Default)]
pub struct Metrics {
    active_connections: AtomicI64,
    registered_users: AtomicI64,
    messages_routed: AtomicU64,
    messages_dropped: AtomicU64,
    invalid_payloads: AtomicU64,
    route_errors: AtomicU64,
    processor_shed: AtomicU64,
    send_timeouts: AtomicU64,
    peer_offline_replies: AtomicU64,
    routed_by_type: Mutex<HashMap<&'static str, u64>>,
    duplicates_by_kind: Mutex<HashMap<&'static str, u64>>,
    breaker_open: Mutex<HashMap<&'static str, bool>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub active_connections: i64,
    pub registered_users: i64,
    pub messages_routed: u64,
    pub messages_dropped: u64,
    pub invalid_payloads: u64,
    pub route_errors: u64,
    pub processor_shed: u64,
    pub send_timeouts: u64,
    pub peer_offline_replies: u64,
    pub routed_by_type: HashMap<&'static str, u64>,
    pub duplicates_by_kind: HashMap<&'static str, u64>,
    pub breaker_open: HashMap<&'static str, bool>,
}

impl Metrics {
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn user_registered(&self) {
        self.registered_users.fetch_add(1, Ordering::SeqCst);
    }

    pub fn user_unregistered(&self) {
        self.registered_users.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn message_routed(&self, message_type: &'static str) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
        let mut map = self.routed_by_type.lock().expect("metrics lock");
        *map.entry(message_type).or_insert(0) += 1;
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalid_payload(&self) {
        self.invalid_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn route_error(&self) {
        self.route_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_shed(&self) {
        self.processor_shed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_timeout(&self) {
        self.send_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_offline_reply(&self) {
        self.peer_offline_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_suppressed(&self, kind: &'static str) {
        let mut map = self.duplicates_by_kind.lock().expect("metrics lock");
        *map.entry(kind).or_insert(0) += 1;
    }

    pub fn set_breaker_open(&self, name: &'static str, open: bool) {
        let mut map = self.breaker_open.lock().expect("metrics lock");
        map.insert(name, open);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::SeqCst),
            registered_users: self.registered_users.load(Ordering::SeqCst),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            invalid_payloads: self.invalid_payloads.load(Ordering::Relaxed),
            route_errors: self.route_errors.load(Ordering::Relaxed),
            processor_shed: self.processor_shed.load(Ordering::Relaxed),
            send_timeouts: self.send_timeouts.load(Ordering::Relaxed),
            peer_offline_replies: self.peer_offline_replies.load(Ordering::Relaxed),
            routed_by_type: self.routed_by_type.lock().expect("metrics lock").clone(),
            duplicates_by_kind: self
                .duplicates_by_kind
                .lock()
                .expect("metrics lock")
                .clone(),
            breaker_open: self.breaker_open.lock().expect("metrics lock").clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_snapshot() {
        let m = Metrics::default();
        m.connection_opened();
        m.connection_opened();
        m.connection_closed();
        m.message_routed("message");
        m.message_routed("message");
        m.message_routed("typing");
        m.duplicate_suppressed("message");
        m.set_breaker_open("last_seen_update", true);

        let snap = m.snapshot();
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.messages_routed, 3);
        assert_eq!(snap.routed_by_type.get("message"), Some(&2));
        assert_eq!(snap.duplicates_by_kind.get("message"), Some(&1));
        assert_eq!(snap.breaker_open.get("last_seen_update"), Some(&true));
    }
}

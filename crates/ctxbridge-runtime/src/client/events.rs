use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by `on`, used to remove that listener with `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Local fan-out of incoming events. Listeners of one event run in
/// registration order.
#[derive(Default)]
pub struct EventListeners {
    next: AtomicU64,
    map: DashMap<String, Vec<(ListenerId, Listener)>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next.fetch_add(1, Ordering::Relaxed));
        self.map
            .entry(event.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let Some(mut list) = self.map.get_mut(event) else { return false };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            drop(list);
            self.map.remove_if(event, |_, l| l.is_empty());
        }
        removed
    }

    /// Invoke every listener of `event`. Returns how many ran. A panicking
    /// listener is logged and skipped; the rest still run.
    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        // Snapshot first: a listener may call `on`/`off`.
        let listeners: Vec<Listener> = match self.map.get(event) {
            Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return 0,
        };
        let mut ran = 0;
        for l in &listeners {
            match catch_unwind(AssertUnwindSafe(|| l(payload))) {
                Ok(()) => ran += 1,
                Err(_) => tracing::warn!(event, "event listener panicked"),
            }
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn listeners_run_in_registration_order() {
        let events = EventListeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            events.on("changed", Arc::new(move |v: &Value| seen.lock().unwrap().push(format!("{tag}:{v}"))));
        }
        assert_eq!(events.emit("changed", &json!(1)), 3);
        assert_eq!(*seen.lock().unwrap(), ["first:1", "second:1", "third:1"]);
    }

    #[test]
    fn off_removes_only_that_listener() {
        let events = EventListeners::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h1 = Arc::clone(&hits);
        let h2 = Arc::clone(&hits);
        let a = events.on("changed", Arc::new(move |_: &Value| { h1.fetch_add(1, Ordering::SeqCst); }));
        events.on("changed", Arc::new(move |_: &Value| { h2.fetch_add(10, Ordering::SeqCst); }));

        assert!(events.off("changed", a));
        assert!(!events.off("changed", a));
        events.emit("changed", &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(events.emit("other", &Value::Null), 0);
    }

    #[test]
    fn panicking_listener_does_not_stop_the_others() {
        let events = EventListeners::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        events.on("changed", Arc::new(|_: &Value| panic!("listener bug")));
        events.on("changed", Arc::new(move |_: &Value| { h.fetch_add(1, Ordering::SeqCst); }));

        assert_eq!(events.emit("changed", &Value::Null), 1);
        assert_eq!(events.emit("changed", &Value::Null), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}

//! Typed publisher/subscriber signals, standing in for the reference
//! client's named-signal registry (`on_message`, `on_error`, ...).
//!
//! Each `Signal<T>` holds a copy-on-write list of subscriber closures and
//! invokes them synchronously, in registration order, on the emitting
//! task.

use std::sync::Arc;

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Signal<T> {
    subscribers: Vec<Subscriber<T>>,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Signal {
            subscribers: Vec::new(),
        }
    }

    pub fn connect<F>(&mut self, f: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribers.push(Arc::new(f));
    }

    pub fn emit(&self, event: &T) {
        for subscriber in &self.subscribers {
            subscriber(event);
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribers_invoked_in_order() {
        let mut signal: Signal<u32> = Signal::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let seen1 = seen.clone();
        signal.connect(move |v| seen1.lock().unwrap().push(*v));
        let seen2 = seen.clone();
        signal.connect(move |v| seen2.lock().unwrap().push(*v * 10));

        signal.emit(&5);
        assert_eq!(*seen.lock().unwrap(), vec![5, 50]);
    }

    #[test]
    fn emit_with_no_subscribers_is_a_no_op() {
        let signal: Signal<u32> = Signal::new();
        let counter = AtomicUsize::new(0);
        signal.emit(&1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}

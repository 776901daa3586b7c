//! Subscription registry and the dispatch loop.
//!
//! Every subscription of one context on one stream shares a single consumer
//! id. New handlers are queued and merged at the start of the next pass, so a
//! handler may subscribe further handlers without deadlocking the loop.

use super::stream::Stream;
use crate::error::{MomentumError, MomentumResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Slice spent waiting on one stream before checking the next one
const ROUND_ROBIN_SLICE: Duration = Duration::from_millis(1);

/// Longest wait before re-checking cancellation and new subscriptions
const MAX_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Receives the payload of every publication delivered on a stream
pub trait Handler: Send {
    fn handle(&mut self, payload: &[u8]);
}

impl<F> Handler for F
where
    F: FnMut(&[u8]) + Send,
{
    fn handle(&mut self, payload: &[u8]) {
        self(payload)
    }
}

/// A handler that panicked during delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerPanic {
    pub stream: String,
    pub sequence: u64,
    pub message: String,
}

impl std::fmt::Display for HandlerPanic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "handler on stream '{}' panicked at sequence {}: {}",
            self.stream, self.sequence, self.message
        )
    }
}

struct Consumer {
    stream: Stream,
    id: usize,
}

/// Handlers of one stream as seen by the dispatch loop
struct Delivery {
    stream: Stream,
    consumer_id: usize,
    handlers: Vec<Box<dyn Handler>>,
    /// Newest sequence handed to the handlers
    last_seq: u64,
}

pub(crate) struct Dispatcher {
    consumers: Mutex<HashMap<String, Consumer>>,
    pending: Mutex<Vec<(String, Box<dyn Handler>)>>,
    deliveries: Mutex<Vec<Delivery>>,
    errors: Mutex<Vec<HandlerPanic>>,
    cancel: Arc<AtomicBool>,
    pid: u32,
}

impl Dispatcher {
    pub(crate) fn new(cancel: Arc<AtomicBool>) -> Self {
        Self {
            consumers: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            deliveries: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            cancel,
            pid: std::process::id(),
        }
    }

    /// Register `handler` on `stream`.
    ///
    /// The consumer id is claimed before returning, so every send that starts
    /// after this call is delivered.
    pub(crate) fn subscribe(&self, stream: &Stream, handler: Box<dyn Handler>) -> MomentumResult<()> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(MomentumError::Cancelled);
        }

        {
            let mut consumers = self.consumers.lock();
            if !consumers.contains_key(stream.name()) {
                let id = stream.pool().register_consumer(self.pid)?;
                log::debug!("Subscribed to stream '{}' as consumer {}", stream.name(), id);
                consumers.insert(
                    stream.name().to_string(),
                    Consumer {
                        stream: stream.clone(),
                        id,
                    },
                );
            }
        }

        self.pending.lock().push((stream.name().to_string(), handler));
        stream.pool().wake_all();
        Ok(())
    }

    pub(crate) fn has_subscriptions(&self) -> bool {
        !self.consumers.lock().is_empty()
    }

    pub(crate) fn take_errors(&self) -> Vec<HandlerPanic> {
        std::mem::take(&mut *self.errors.lock())
    }

    /// Background loop: dispatch until the context is cancelled
    pub(crate) fn run(&self) {
        log::debug!("Dispatch loop started");
        while !self.cancel.load(Ordering::Acquire) {
            if let Err(MomentumError::Cancelled) = self.dispatch(MAX_IDLE_WAIT) {
                break;
            }
        }
        log::debug!("Dispatch loop stopped");
    }

    /// Deliver what is available, waiting up to `timeout` for the first
    /// publication. Returns the number of payloads handed to handlers.
    pub(crate) fn dispatch(&self, timeout: Duration) -> MomentumResult<usize> {
        let mut deliveries = self.deliveries.lock();
        let result = self.dispatch_locked(&mut deliveries, timeout);
        // Teardown from inside a handler cannot take the lock we hold
        if self.cancel.load(Ordering::Acquire) {
            deliveries.clear();
        }
        result
    }

    fn dispatch_locked(
        &self,
        deliveries: &mut Vec<Delivery>,
        timeout: Duration,
    ) -> MomentumResult<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.cancel.load(Ordering::Acquire) {
                return Err(MomentumError::Cancelled);
            }

            self.merge_pending(deliveries);
            // Read before scanning so a publish during the pass is not slept through
            let tokens: Vec<u32> = deliveries
                .iter()
                .map(|d| d.stream.pool().ready_token())
                .collect();

            let delivered: usize = deliveries.iter_mut().map(|d| self.deliver(d)).sum();
            if delivered > 0 {
                return Ok(delivered);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            let remaining = (deadline - now).min(MAX_IDLE_WAIT);

            match deliveries.len() {
                0 => std::thread::sleep(remaining.min(ROUND_ROBIN_SLICE)),
                1 => deliveries[0].stream.pool().wait_ready(tokens[0], remaining),
                _ => {
                    for (delivery, token) in deliveries.iter().zip(&tokens) {
                        delivery
                            .stream
                            .pool()
                            .wait_ready(*token, ROUND_ROBIN_SLICE.min(remaining));
                        if delivery.stream.pool().ready_token() != *token {
                            break;
                        }
                    }
                }
            }
        }
    }

    fn merge_pending(&self, deliveries: &mut Vec<Delivery>) {
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return;
        }

        let consumers = self.consumers.lock();
        for (name, handler) in pending {
            if let Some(delivery) = deliveries.iter_mut().find(|d| d.stream.name() == name) {
                delivery.handlers.push(handler);
                continue;
            }
            let Some(consumer) = consumers.get(&name) else {
                continue;
            };
            deliveries.push(Delivery {
                stream: consumer.stream.clone(),
                consumer_id: consumer.id,
                handlers: vec![handler],
                last_seq: 0,
            });
        }
    }

    fn deliver(&self, delivery: &mut Delivery) -> usize {
        let pool = delivery.stream.pool();
        let ready = pool.consumable_slots(delivery.consumer_id);
        if ready.is_empty() {
            return 0;
        }

        let to_deliver = if delivery.stream.is_broadcast() {
            &ready[..]
        } else {
            // Latest-only: superseded publications are acknowledged unseen
            let newest = ready.len() - 1;
            for &(seq, index) in &ready[..newest] {
                pool.acknowledge(index, delivery.consumer_id, seq);
            }
            &ready[newest..]
        };

        let mut delivered = 0;
        for &(seq, index) in to_deliver {
            if self.cancel.load(Ordering::Acquire) {
                break;
            }
            if !delivery.stream.is_broadcast() && seq <= delivery.last_seq {
                pool.acknowledge(index, delivery.consumer_id, seq);
                continue;
            }
            if !pool.begin_read(index, delivery.consumer_id, seq) {
                continue;
            }

            let len = pool.slot_len(index);
            // SAFETY: the read pin keeps the slot Ready until end_read
            let payload = unsafe { std::slice::from_raw_parts(pool.slot_data_ptr(index), len) };
            for handler in delivery.handlers.iter_mut() {
                let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(payload)));
                if let Err(cause) = result {
                    let failure = HandlerPanic {
                        stream: delivery.stream.name().to_string(),
                        sequence: seq,
                        message: panic_message(cause.as_ref()),
                    };
                    log::error!("{}", failure);
                    self.errors.lock().push(failure);
                }
            }

            // Acknowledge before unpinning so the slot cannot be reclaimed in between
            delivery.stream.release(index, delivery.consumer_id);
            pool.end_read(index);
            delivery.last_seq = seq;
            delivered += 1;
        }
        delivered
    }

    /// Release every consumer id and drop all handlers.
    ///
    /// Safe to call from a handler: a pass in progress keeps its deliveries
    /// until it observes the cancel flag and clears them itself.
    pub(crate) fn shutdown(&self) {
        self.pending.lock().clear();
        if let Some(mut deliveries) = self.deliveries.try_lock() {
            deliveries.clear();
        }
        for (name, consumer) in self.consumers.lock().drain() {
            consumer.stream.pool().unregister_consumer(consumer.id);
            log::debug!("Unsubscribed from stream '{}'", name);
        }
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = cause.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = cause.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closures_are_handlers() {
        let mut seen = Vec::new();
        {
            let mut handler = |payload: &[u8]| seen.extend_from_slice(payload);
            Handler::handle(&mut handler, b"ab");
            Handler::handle(&mut handler, b"c");
        }
        assert_eq!(seen, b"abc");
    }

    #[test]
    fn test_panic_message_extraction() {
        let cause = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(cause.as_ref()), "static");
        let cause = panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(cause.as_ref()), "formatted 7");
    }
}

//! Time-ordered event queue.
//!
//! Events carry a millisecond due time, a callback id and caller data. The
//! queue lock is only held while popping, so callbacks may schedule further
//! events (e.g. re-arm themselves) on the same queue.

use super::binary_heap::{BinaryHeap, HeapElem};
use crate::error::{Result, StateError};
use crate::memory::Memf;
use log::{debug, warn};
use parking_lot::Mutex;

const MAX_CALLBACKS: usize = 256;

/// Handler invoked for a due event: `(queue, event_time_ms, data)`.
pub type EventCallback<T> = Box<dyn Fn(&EventQueue<T>, u64, T) -> Result<()> + Send + Sync>;

struct Event<T> {
    event_id: u8,
    data: T,
}

pub struct EventQueue<T> {
    queue: Mutex<BinaryHeap<Event<T>>>,
    callbacks: Vec<Option<EventCallback<T>>>,
}

fn by_time<T>(a: &HeapElem<Event<T>>, b: &HeapElem<Event<T>>) -> std::cmp::Ordering {
    a.key.cmp(&b.key)
}

impl<T> EventQueue<T> {
    pub fn new(memf: Memf) -> Self {
        Self {
            queue: Mutex::new(BinaryHeap::new(memf, by_time::<T>)),
            callbacks: (0..MAX_CALLBACKS).map(|_| None).collect(),
        }
    }

    /// Registers the handler for `event_id`, replacing any previous one.
    pub fn add_callback(&mut self, event_id: u8, callback: EventCallback<T>) {
        self.callbacks[event_id as usize] = Some(callback);
    }

    /// Schedules an event at `msec_time`.
    pub fn add_event(&self, msec_time: u64, event_id: u8, data: T) -> Result<()> {
        if self.callbacks[event_id as usize].is_none() {
            return Err(StateError::InvalidArgument(format!(
                "no callback registered for event {}",
                event_id
            )));
        }
        self.queue.lock().insert(HeapElem {
            key: msec_time,
            data: Event { event_id, data },
        })
    }

    /// Runs events due at `now_ms`, at most `max_events` of them (0 = no limit).
    /// Returns the number processed.
    pub fn process_events(&self, now_ms: u64, max_events: usize) -> usize {
        let mut processed = 0;
        while max_events == 0 || processed < max_events {
            let elem = {
                let mut queue = self.queue.lock();
                match queue.find_min().map(|min| min.key) {
                    Some(due) if due <= now_ms => queue.remove_min(),
                    Some(due) => {
                        debug!("Event queue is {} ms ahead", due - now_ms);
                        None
                    }
                    None => None,
                }
            };
            let Some(elem) = elem else { break };

            if let Some(callback) = &self.callbacks[elem.data.event_id as usize] {
                if let Err(e) = callback(self, elem.key, elem.data.data) {
                    warn!("Event {} callback failed: {}", elem.data.event_id, e);
                }
            }
            processed += 1;
        }
        processed
    }

    pub fn events_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Milliseconds until the next event is due, `None` when empty.
    pub fn delay(&self, now_ms: u64) -> Option<u64> {
        self.queue
            .lock()
            .find_min()
            .map(|min| min.key.saturating_sub(now_ms))
    }
}

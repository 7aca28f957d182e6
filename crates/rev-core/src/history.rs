//! Bounded record of recent engine states for plotting and export.
//!
//! The clock pushes every tick into a wait-free SPSC ring ([`HistoryFeed`]);
//! the consumer side ([`StateHistory`]) drains it into a bounded window that
//! evicts oldest-first. Consumers only ever see copies.

use crate::state::EngineState;
use rtrb::{Consumer, Producer, RingBuffer};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Producer half, owned by the simulation clock.
pub struct HistoryFeed {
    producer: Producer<EngineState>,
    dropped: u64,
}

impl HistoryFeed {
    /// Never blocks. If consumers have fallen behind the state is dropped
    /// and counted.
    pub fn push(&mut self, state: EngineState) {
        if self.producer.push(state).is_err() {
            self.dropped += 1;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Consumer half: the retained window.
pub struct StateHistory {
    consumer: Consumer<EngineState>,
    window: VecDeque<EngineState>,
    capacity: usize,
    evicted: u64,
}

pub type SharedHistory = Arc<Mutex<StateHistory>>;

/// `capacity` is the number of states retained; `feed_capacity` bounds how
/// many may queue up between two drains.
pub fn history_channel(capacity: usize, feed_capacity: usize) -> (HistoryFeed, StateHistory) {
    let capacity = capacity.max(1);
    let (producer, consumer) = RingBuffer::new(feed_capacity.max(1));
    (
        HistoryFeed {
            producer,
            dropped: 0,
        },
        StateHistory {
            consumer,
            window: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        },
    )
}

impl StateHistory {
    /// Move everything queued by the clock into the window. Returns how many
    /// states arrived.
    pub fn drain(&mut self) -> usize {
        let mut received = 0;
        while let Ok(state) = self.consumer.pop() {
            if self.window.len() == self.capacity {
                self.window.pop_front();
                self.evicted += 1;
            }
            self.window.push_back(state);
            received += 1;
        }
        received
    }

    /// Copy of the retained window, oldest first.
    pub fn snapshot(&mut self) -> Vec<EngineState> {
        self.drain();
        self.window.iter().copied().collect()
    }

    pub fn latest(&self) -> Option<EngineState> {
        self.window.back().copied()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Forget everything retained, including states still queued.
    pub fn clear(&mut self) {
        while self.consumer.pop().is_ok() {}
        self.window.clear();
    }

    pub fn into_shared(self) -> SharedHistory {
        Arc::new(Mutex::new(self))
    }
}

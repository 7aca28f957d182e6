//! Wait-free hand-off between the simulation clock and everything that
//! reads from it.
//!
//! Each value crosses threads through a [`TripleBuffer`]: the writer fills a
//! slot nobody is pointed at, then flips the published index. Every slot
//! carries a sequence counter, so a reader that loses the race with two
//! consecutive writes to the same slot sees the counter move and copies
//! again instead of returning a torn value.

use crate::state::{ControlInput, EngineState};
use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};

struct Slot<T> {
    seq: AtomicU64,
    value: UnsafeCell<T>,
}

struct TripleBuffer<T: Copy + Default> {
    slots: [Slot<T>; 3],
    index: AtomicUsize,
    writing: AtomicBool,
}

unsafe impl<T: Copy + Default + Send> Send for TripleBuffer<T> {}
unsafe impl<T: Copy + Default + Send> Sync for TripleBuffer<T> {}

impl<T: Copy + Default> TripleBuffer<T> {
    fn new() -> Self {
        let slots = std::array::from_fn(|_| Slot {
            seq: AtomicU64::new(0),
            value: UnsafeCell::new(T::default()),
        });
        Self {
            slots,
            index: AtomicUsize::new(0),
            writing: AtomicBool::new(false),
        }
    }

    fn write(&self, value: T) {
        // Writers serialise among themselves; readers never touch this flag.
        while self
            .writing
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }

        let next = (self.index.load(Ordering::Relaxed) + 1) % 3;
        let slot = &self.slots[next];
        let seq = slot.seq.load(Ordering::Relaxed);
        slot.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        unsafe {
            std::ptr::write_volatile(slot.value.get(), value);
        }
        slot.seq.store(seq.wrapping_add(2), Ordering::Release);
        self.index.store(next, Ordering::Release);

        self.writing.store(false, Ordering::Release);
    }

    fn read(&self) -> T {
        loop {
            let slot = &self.slots[self.index.load(Ordering::Acquire)];
            let before = slot.seq.load(Ordering::Acquire);
            if before & 1 == 0 {
                let value = unsafe { std::ptr::read_volatile(slot.value.get()) };
                fence(Ordering::Acquire);
                if slot.seq.load(Ordering::Relaxed) == before {
                    return value;
                }
            }
            std::hint::spin_loop();
        }
    }
}

/// The two most recent published states. `sequence` counts publishes; zero
/// means nothing has been published yet.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatePair {
    pub previous: EngineState,
    pub current: EngineState,
    pub sequence: u64,
}

/// Shared between the clock (writer of state, reader of control) and every
/// consumer (readers of state, writers of control).
pub struct StateExchange {
    state: TripleBuffer<StatePair>,
    control: TripleBuffer<ControlInput>,
    published: AtomicU64,
}

impl StateExchange {
    pub fn new() -> Self {
        Self {
            state: TripleBuffer::new(),
            control: TripleBuffer::new(),
            published: AtomicU64::new(0),
        }
    }

    /// Called by the clock once per tick (non-blocking).
    pub fn publish_state(&self, state: EngineState) {
        let last = self.state.read();
        let sequence = last.sequence.wrapping_add(1);
        let previous = if last.sequence == 0 {
            state
        } else {
            last.current
        };
        self.state.write(StatePair {
            previous,
            current: state,
            sequence,
        });
        self.published.store(sequence, Ordering::Release);
    }

    /// Forget everything published so far, as if freshly built. Only valid
    /// while no clock is writing.
    pub fn reset_state(&self) {
        self.state.write(StatePair::default());
        self.published.store(0, Ordering::Release);
    }

    /// Latest pair for interpolation, `None` before the first publish.
    pub fn latest_pair(&self) -> Option<StatePair> {
        let pair = self.state.read();
        (pair.sequence != 0).then_some(pair)
    }

    pub fn read_state(&self) -> Option<EngineState> {
        self.latest_pair().map(|pair| pair.current)
    }

    /// Number of states published so far; cheap enough to poll.
    pub fn published_sequence(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Called by UI/bridge threads; latest value wins.
    pub fn submit_control(&self, control: ControlInput) {
        self.control.write(control);
    }

    /// Called by the clock once per tick.
    pub fn read_control(&self) -> ControlInput {
        self.control.read()
    }
}

impl Default for StateExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn nothing_before_first_publish() {
        let exchange = StateExchange::new();
        assert!(exchange.latest_pair().is_none());
        assert_eq!(exchange.published_sequence(), 0);
    }

    #[test]
    fn pair_tracks_previous_and_current() {
        let exchange = StateExchange::new();
        let a = EngineState {
            tick: 1,
            rpm: 1000.0,
            ..Default::default()
        };
        let b = EngineState {
            tick: 2,
            rpm: 1100.0,
            ..Default::default()
        };

        exchange.publish_state(a);
        let first = exchange.latest_pair().unwrap();
        assert_eq!(first.previous, a);
        assert_eq!(first.current, a);

        exchange.publish_state(b);
        let second = exchange.latest_pair().unwrap();
        assert_eq!(second.previous, a);
        assert_eq!(second.current, b);
        assert_eq!(second.sequence, 2);
    }

    #[test]
    fn control_is_latest_value_wins() {
        let exchange = StateExchange::new();
        assert_eq!(exchange.read_control(), ControlInput::default());
        exchange.submit_control(ControlInput::new(0.2, 10.0));
        exchange.submit_control(ControlInput::new(0.7, 20.0));
        assert_eq!(exchange.read_control(), ControlInput::new(0.7, 20.0));
    }

    #[test]
    fn concurrent_readers_never_see_torn_state() {
        // Every field of a published state is derived from its tick, so a
        // mix of two writes is detectable.
        fn state_for(tick: u64) -> EngineState {
            let t = tick as f64;
            EngineState {
                tick,
                rpm: t,
                torque_nm: t * 2.0,
                angular_acceleration: -t,
                yield_w: t * 3.0,
            }
        }

        let exchange = Arc::new(StateExchange::new());
        let writer = {
            let exchange = Arc::clone(&exchange);
            thread::spawn(move || {
                for tick in 1..=200_000u64 {
                    exchange.publish_state(state_for(tick));
                }
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let exchange = Arc::clone(&exchange);
                thread::spawn(move || {
                    let mut last_sequence = 0;
                    for _ in 0..200_000 {
                        if let Some(pair) = exchange.latest_pair() {
                            assert_eq!(pair.current, state_for(pair.current.tick));
                            assert_eq!(pair.previous, state_for(pair.previous.tick));
                            assert!(pair.sequence >= last_sequence);
                            last_sequence = pair.sequence;
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}

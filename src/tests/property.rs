//! Property-based tests for verifying scheduler invariants.

use super::helpers::*;
use crate::arch::sim::{SimContext, SimPlatform};
use crate::event::Event;
use crate::fiber::FiberId;
use crate::sched::{FiberTable, QueueId};
use alloc::vec::Vec;

/// Simple linear congruential generator for property testing.
struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state >> 16
    }

    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        min + (self.next_u64() % (max - min))
    }

    fn pick<T: Copy>(&mut self, items: &[T]) -> T {
        items[self.gen_range(0, items.len() as u64) as usize]
    }
}

#[test]
fn property_queue_membership_is_exclusive() {
    for seed in [1, 0xDEAD_BEEF, 0x1234_5678_9ABC] {
        let mut rng = SimpleRng::new(seed);
        let mut table: FiberTable<SimContext> = FiberTable::new();
        let mut ids: Vec<FiberId> = Vec::new();

        for _ in 0..500 {
            match rng.gen_range(0, 5) {
                0 => {
                    // Pooled records come back with the same id.
                    let id = table.allocate();
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                1 | 2 if !ids.is_empty() => {
                    let id = rng.pick(&ids);
                    let queue = rng.pick(&QueueId::ALL);
                    table.queue_fiber(id, queue);
                    assert_eq!(table.fiber(id).queue(), Some(queue));
                }
                3 if !ids.is_empty() => {
                    let id = rng.pick(&ids);
                    table.dequeue_fiber(id);
                    assert_eq!(table.fiber(id).queue(), None);
                }
                4 if !ids.is_empty() => {
                    let id = rng.pick(&ids);
                    table.recycle(id);
                }
                _ => {}
            }

            assert!(table.is_consistent());
            let linked: usize = QueueId::ALL.iter().map(|&q| table.len(q)).sum();
            let claimed = ids
                .iter()
                .filter(|&&id| table.fiber(id).queue().is_some())
                .count();
            assert_eq!(linked, claimed);
        }
    }
}

#[test]
fn property_sleep_wakes_on_first_tick_at_deadline() {
    let mut rng = SimpleRng::new(0xC0FFEE);
    let scheduler = scheduler();
    let period = scheduler.config().tick_period_ms;
    tick_on_idle(scheduler);

    for _ in 0..50 {
        let delay = rng.gen_range(0, 100) as u32;
        let start = scheduler.ticks();

        scheduler.fiber_sleep(delay);
        let woke = scheduler.ticks() - start;

        // Never early, and no later than the first tick at or past the
        // deadline. The tick at `start` has already happened.
        let expected = (delay.max(1) + period - 1) / period * period;
        assert_eq!(woke, expected, "delay {}", delay);
    }
}

#[test]
fn property_event_delivery_wakes_exact_matches_only() {
    let mut rng = SimpleRng::new(0xE7E7);

    for _ in 0..10 {
        let scheduler = scheduler();
        let mut waiters = Vec::new();

        for _ in 0..8 {
            let id = rng.gen_range(1, 4) as u16;
            let value = rng.gen_range(1, 4) as u16;
            let fiber = scheduler.create_fiber(noop).unwrap();

            scheduler.schedule();
            assert_eq!(scheduler.current(), Some(fiber));
            scheduler.launch_current();
            scheduler.fiber_wait_for_event(id, value);

            waiters.push((fiber, id, value));
        }

        let evt = Event::new(rng.gen_range(1, 4) as u16, rng.gen_range(1, 4) as u16);
        SimPlatform::interrupt(|| scheduler.scheduler_event(evt));

        for (fiber, id, value) in waiters {
            let expected = if (id, value) == (evt.source, evt.value) {
                QueueId::Run
            } else {
                QueueId::Wait
            };
            assert_eq!(info(scheduler, fiber).queue, Some(expected));
        }
        assert!(scheduler.with_table(|table| table.is_consistent()));
    }
}

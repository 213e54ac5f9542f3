use crate::commons::microtime;
use crate::error::Evicted;
use crate::runtime;
use crate::sync::{SpinLock, Waiter, WakeStatus};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-proclet logical clock: `logical_us = physical_us + offset`. The
/// offset is recomputed at migration install so that time observed inside a
/// proclet never moves backwards across a move, even though the two hosts'
/// monotonic clocks share no epoch.
pub struct ProcletClock {
    offset_us: AtomicI64,
    timers: SpinLock<Vec<TimerRecord>>,
}

/// A pending in-proclet sleep. Kept for monitoring and for the migration
/// header's timer count; the sleep itself is re-established at the
/// destination when the evicted call re-issues.
#[derive(Copy, Clone, Debug)]
pub struct TimerRecord {
    pub logical_deadline_us: u64,
    pub thread: u64,
}

impl ProcletClock {
    pub fn new() -> ProcletClock {
        ProcletClock {
            offset_us: AtomicI64::new(0),
            timers: SpinLock::new(Vec::new()),
        }
    }

    /// Fresh clock continuing from a logical timestamp captured on the
    /// migration source.
    pub fn continuing_from(logical_us: u64) -> ProcletClock {
        let clock = ProcletClock::new();
        clock
            .offset_us
            .store(logical_us as i64 - microtime() as i64, Ordering::Relaxed);
        clock
    }

    pub fn logical_now_us(&self) -> u64 {
        (microtime() as i64 + self.offset_us.load(Ordering::Relaxed)).max(0) as u64
    }

    pub fn num_pending_timers(&self) -> usize {
        self.timers.lock().len()
    }

    fn register(&self, record: TimerRecord) {
        self.timers.lock().push(record);
    }

    fn unregister(&self, thread: u64) {
        self.timers.lock().retain(|t| t.thread != thread);
    }
}

impl Default for ProcletClock {
    fn default() -> ProcletClock {
        ProcletClock::new()
    }
}

/// Time as observed by proclet code. Outside a proclet these fall through
/// to the host's monotonic clock.
pub struct Time;

impl Time {
    pub const MILLISECONDS: u64 = 1000;
    pub const SECONDS: u64 = 1_000_000;

    pub fn microtime() -> u64 {
        match runtime::current_header() {
            Some(header) => header.clock.logical_now_us(),
            None => microtime(),
        }
    }

    /// Sleeps for `duration_us` of logical time. The deadline is computed at
    /// entry, so a call evicted by migration and re-issued at the
    /// destination restarts the full duration; use `sleep_until` to hold a
    /// fixed logical deadline across a move.
    pub fn sleep(duration_us: u64) -> Result<(), Evicted> {
        Time::sleep_until(Time::microtime() + duration_us)
    }

    pub fn sleep_until(logical_deadline_us: u64) -> Result<(), Evicted> {
        let ctx = match runtime::dispatch_ctx() {
            Some(ctx) => ctx,
            None => {
                let now = microtime();
                if logical_deadline_us > now {
                    std::thread::sleep(Duration::from_micros(logical_deadline_us - now));
                }
                return Ok(());
            }
        };

        let header = ctx.header();
        header.clock.register(TimerRecord {
            logical_deadline_us,
            thread: ctx.entry.id(),
        });

        let result = loop {
            let now = header.clock.logical_now_us();
            if now >= logical_deadline_us {
                break Ok(());
            }
            let waiter = Arc::new(Waiter::new());
            ctx.entry.publish_wait(&waiter, true);
            if header.is_migrating() {
                ctx.entry.clear_wait();
                break Err(Evicted);
            }
            let deadline = Instant::now() + Duration::from_micros(logical_deadline_us - now);
            let status = waiter.wait_deadline(deadline);
            ctx.entry.clear_wait();
            match status {
                WakeStatus::Evicted => break Err(Evicted),
                // Timeout means the deadline passed; anything else is a
                // spurious wake and we re-check the clock.
                WakeStatus::Timeout | WakeStatus::Notified => continue,
            }
        };

        header.clock.unregister(ctx.entry.id());
        result
    }

    /// Short busy delay that never yields the dispatch thread.
    pub fn delay(us: u64) {
        let start = microtime();
        while microtime() < start + us {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_clock_never_regresses_across_handoff() {
        let clock = ProcletClock::new();
        let before = clock.logical_now_us();
        // Simulate a migration capture/install pair.
        let captured = clock.logical_now_us();
        let dest = ProcletClock::continuing_from(captured);
        let after = dest.logical_now_us();
        assert!(after >= before);
    }

    #[test]
    fn continuing_clock_preserves_large_offsets() {
        let source_logical = microtime() + 5 * Time::SECONDS;
        let dest = ProcletClock::continuing_from(source_logical);
        let now = dest.logical_now_us();
        assert!(now >= source_logical);
        assert!(now < source_logical + Time::SECONDS);
    }

    #[test]
    fn sleep_outside_proclet_blocks_for_duration() {
        let start = microtime();
        Time::sleep(5 * Time::MILLISECONDS).unwrap();
        assert!(microtime() - start >= 5 * Time::MILLISECONDS);
    }

    #[test]
    fn timer_registry_tracks_pending_sleeps() {
        let clock = ProcletClock::new();
        clock.register(TimerRecord {
            logical_deadline_us: 123,
            thread: 7,
        });
        assert_eq!(clock.num_pending_timers(), 1);
        clock.unregister(7);
        assert_eq!(clock.num_pending_timers(), 0);
    }
}

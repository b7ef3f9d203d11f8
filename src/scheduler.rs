//! Timer and clock abstractions
//!
//! The watchdog never touches tokio timers directly. It asks a [`Scheduler`]
//! for a cancellable timer keyed by [`TimerKey`]; whoever owns the event loop
//! turns the firing back into a host event. Tests drive the same code with
//! [`ManualScheduler`], a virtual clock.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::terminal::TerminalId;

/// Which handshake step a watchdog timer is supervising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchdogPhase {
    /// UI confirms it registered the terminal surface
    Ack,
    /// Shell reaches an interactive prompt
    Prompt,
}

impl WatchdogPhase {
    pub fn label(self) -> &'static str {
        match self {
            WatchdogPhase::Ack => "ack",
            WatchdogPhase::Prompt => "prompt",
        }
    }
}

impl fmt::Display for WatchdogPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of one scheduled firing. `generation` changes whenever the
/// watchdog re-arms, so a firing that raced a `stop` is recognisably stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub terminal_id: TerminalId,
    pub phase: WatchdogPhase,
    pub generation: u64,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, key: TimerKey) -> TimerHandle;
}

/// Cancellation handle for a scheduled timer. Dropping it does not cancel.
#[must_use = "dropping a TimerHandle leaves the timer armed"]
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Real timers on the tokio runtime. Each firing is handed to `fire`, which
/// normally posts a timer event into the host loop.
#[derive(Clone)]
pub struct TokioScheduler {
    runtime: tokio::runtime::Handle,
    fire: Arc<dyn Fn(TimerKey) + Send + Sync>,
}

impl TokioScheduler {
    /// Must be called from within a tokio runtime.
    pub fn new(fire: impl Fn(TimerKey) + Send + Sync + 'static) -> Self {
        Self {
            runtime: tokio::runtime::Handle::current(),
            fire: Arc::new(fire),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, key: TimerKey) -> TimerHandle {
        let fire = self.fire.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            fire(key);
        });
        let abort = task.abort_handle();
        TimerHandle::new(move || abort.abort())
    }
}

impl Clock for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct PendingTimer {
    seq: u64,
    deadline: Duration,
    key: TimerKey,
}

struct ManualState {
    base: Instant,
    elapsed: Duration,
    next_seq: u64,
    pending: Vec<PendingTimer>,
    scheduled_delays: Vec<Duration>,
}

/// Virtual clock and scheduler. Time only moves when [`advance`] is called.
///
/// [`advance`]: ManualScheduler::advance
#[derive(Clone)]
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                base: Instant::now(),
                elapsed: Duration::ZERO,
                next_seq: 0,
                pending: Vec::new(),
                scheduled_delays: Vec::new(),
            })),
        }
    }

    /// Move virtual time forward and return every timer that came due,
    /// ordered by deadline then scheduling order.
    pub fn advance(&self, by: Duration) -> Vec<TimerKey> {
        let mut state = self.state.lock();
        state.elapsed += by;
        let now = state.elapsed;

        let mut due = Vec::new();
        let mut remaining = Vec::with_capacity(state.pending.len());
        for timer in state.pending.drain(..) {
            if timer.deadline <= now {
                due.push(timer);
            } else {
                remaining.push(timer);
            }
        }
        state.pending = remaining;

        due.sort_by_key(|timer| (timer.deadline, timer.seq));
        due.into_iter().map(|timer| timer.key).collect()
    }

    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Delays passed to `schedule`, in call order.
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        self.state.lock().scheduled_delays.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, key: TimerKey) -> TimerHandle {
        let seq = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            let deadline = state.elapsed + delay;
            state.scheduled_delays.push(delay);
            state.pending.push(PendingTimer { seq, deadline, key });
            seq
        };

        let state = Arc::downgrade(&self.state);
        TimerHandle::new(move || {
            if let Some(state) = state.upgrade() {
                state.lock().pending.retain(|timer| timer.seq != seq);
            }
        })
    }
}

impl Clock for ManualScheduler {
    fn now(&self) -> Instant {
        let state = self.state.lock();
        state.base + state.elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str, generation: u64) -> TimerKey {
        TimerKey {
            terminal_id: TerminalId::new(id),
            phase: WatchdogPhase::Ack,
            generation,
        }
    }

    #[test]
    fn manual_scheduler_fires_in_deadline_order() {
        let scheduler = ManualScheduler::new();
        let _late = scheduler.schedule(Duration::from_millis(300), key("late", 0));
        let _early = scheduler.schedule(Duration::from_millis(100), key("early", 0));

        assert!(scheduler.advance(Duration::from_millis(50)).is_empty());
        let fired = scheduler.advance(Duration::from_millis(300));
        assert_eq!(fired, vec![key("early", 0), key("late", 0)]);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let scheduler = ManualScheduler::new();
        let handle = scheduler.schedule(Duration::from_millis(10), key("t", 1));
        handle.cancel();

        assert!(scheduler.advance(Duration::from_secs(1)).is_empty());
        assert_eq!(scheduler.scheduled_delays(), vec![Duration::from_millis(10)]);
    }

    #[test]
    fn manual_clock_tracks_virtual_time() {
        let scheduler = ManualScheduler::new();
        let start = scheduler.now();
        scheduler.advance(Duration::from_millis(2500));
        assert_eq!(scheduler.now() - start, Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn tokio_scheduler_delivers_firing() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let scheduler = TokioScheduler::new(move |key| {
            let _ = tx.send(key);
        });

        let _handle = scheduler.schedule(Duration::from_millis(5), key("t", 7));
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.generation, 7);
    }
}

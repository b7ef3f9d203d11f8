use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{
    ACK_BACKOFF_FACTOR, ACK_INITIAL_DELAY_MS, ACK_MAX_ATTEMPTS, PROMPT_BACKOFF_FACTOR,
    PROMPT_INITIAL_DELAY_MS, PROMPT_MAX_ATTEMPTS,
};
use crate::scheduler::{Scheduler, TimerHandle, TimerKey, WatchdogPhase};
use crate::terminal::TerminalId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogOptions {
    pub initial_delay_ms: u64,
    pub max_attempts: u32,
    pub backoff_factor: f64,
}

impl WatchdogOptions {
    pub fn ack() -> Self {
        Self {
            initial_delay_ms: ACK_INITIAL_DELAY_MS,
            max_attempts: ACK_MAX_ATTEMPTS,
            backoff_factor: ACK_BACKOFF_FACTOR,
        }
    }

    pub fn prompt() -> Self {
        Self {
            initial_delay_ms: PROMPT_INITIAL_DELAY_MS,
            max_attempts: PROMPT_MAX_ATTEMPTS,
            backoff_factor: PROMPT_BACKOFF_FACTOR,
        }
    }

    /// Delay before the 1-indexed `attempt`: `initial * factor^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent);
        Duration::from_millis(millis.round().max(0.0) as u64)
    }
}

/// Reported to the owner of the watchdog each time a timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogFiring {
    pub terminal_id: TerminalId,
    pub phase: WatchdogPhase,
    pub attempt: u32,
    pub is_final_attempt: bool,
}

#[derive(Debug)]
struct WatchdogEntry {
    attempt: u32,
    options: WatchdogOptions,
    generation: u64,
    timer: Option<TimerHandle>,
}

/// Supervises outstanding handshake steps, one timer per (terminal, phase).
pub struct InitializationWatchdog {
    scheduler: Arc<dyn Scheduler>,
    entries: HashMap<(TerminalId, WatchdogPhase), WatchdogEntry>,
    next_generation: u64,
}

impl InitializationWatchdog {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            entries: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arm the first attempt. Restarting an armed (terminal, phase) replaces
    /// the old timer.
    pub fn start(&mut self, id: &TerminalId, phase: WatchdogPhase, options: WatchdogOptions) {
        self.stop(id, phase, "restart");
        let generation = self.bump_generation();
        let mut entry = WatchdogEntry {
            attempt: 0,
            options,
            generation,
            timer: None,
        };
        let delay = options.delay_for(1);
        entry.timer = Some(self.scheduler.schedule(
            delay,
            TimerKey {
                terminal_id: id.clone(),
                phase,
                generation,
            },
        ));
        debug!(terminal_id = %id, phase = %phase, delay_ms = delay.as_millis() as u64, "watchdog armed");
        self.entries.insert((id.clone(), phase), entry);
    }

    pub fn stop(&mut self, id: &TerminalId, phase: WatchdogPhase, reason: &str) -> bool {
        match self.entries.remove(&(id.clone(), phase)) {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.cancel();
                }
                debug!(terminal_id = %id, phase = %phase, reason, "watchdog stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&mut self, id: &TerminalId, reason: &str) {
        for phase in [WatchdogPhase::Ack, WatchdogPhase::Prompt] {
            self.stop(id, phase, reason);
        }
    }

    pub fn is_armed(&self, id: &TerminalId, phase: WatchdogPhase) -> bool {
        self.entries.contains_key(&(id.clone(), phase))
    }

    /// Handle a timer firing. Stale keys (stopped or re-armed since) return
    /// `None`. Non-final attempts re-arm the next backoff step; the final
    /// attempt clears the entry and leaves escalation to the caller.
    pub fn on_fire(&mut self, key: &TimerKey) -> Option<WatchdogFiring> {
        let map_key = (key.terminal_id.clone(), key.phase);
        let entry = self.entries.get_mut(&map_key)?;
        if entry.generation != key.generation {
            debug!(terminal_id = %key.terminal_id, phase = %key.phase, "stale watchdog firing ignored");
            return None;
        }

        entry.attempt += 1;
        entry.timer = None;
        let attempt = entry.attempt;
        let is_final_attempt = attempt >= entry.options.max_attempts;

        if is_final_attempt {
            self.entries.remove(&map_key);
            info!(terminal_id = %key.terminal_id, phase = %key.phase, attempt, "watchdog attempts exhausted");
        } else {
            let delay = entry.options.delay_for(attempt + 1);
            let generation = self.next_generation;
            self.next_generation += 1;
            if let Some(entry) = self.entries.get_mut(&map_key) {
                entry.generation = generation;
                entry.timer = Some(self.scheduler.schedule(
                    delay,
                    TimerKey {
                        terminal_id: key.terminal_id.clone(),
                        phase: key.phase,
                        generation,
                    },
                ));
            }
            debug!(
                terminal_id = %key.terminal_id,
                phase = %key.phase,
                attempt,
                next_delay_ms = delay.as_millis() as u64,
                "watchdog fired, re-armed"
            );
        }

        Some(WatchdogFiring {
            terminal_id: key.terminal_id.clone(),
            phase: key.phase,
            attempt,
            is_final_attempt,
        })
    }

    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            if let Some(timer) = entry.timer {
                timer.cancel();
            }
        }
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;

    fn watchdog() -> (ManualScheduler, InitializationWatchdog) {
        let scheduler = ManualScheduler::new();
        let watchdog = InitializationWatchdog::new(Arc::new(scheduler.clone()));
        (scheduler, watchdog)
    }

    #[test]
    fn ack_backoff_schedules_doubling_delays_and_flags_final_attempt() {
        let (scheduler, mut watchdog) = watchdog();
        let id = TerminalId::new("t");
        watchdog.start(&id, WatchdogPhase::Ack, WatchdogOptions::ack());

        let mut firings = Vec::new();
        for step in [700, 1400, 2800, 5600] {
            for key in scheduler.advance(Duration::from_millis(step)) {
                firings.extend(watchdog.on_fire(&key));
            }
        }

        let delays: Vec<u64> = scheduler
            .scheduled_delays()
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![700, 1400, 2800, 5600]);
        assert_eq!(firings.len(), 4);
        assert!(firings[..3].iter().all(|f| !f.is_final_attempt));
        assert_eq!(firings[3].attempt, 4);
        assert!(firings[3].is_final_attempt);
        assert!(!watchdog.is_armed(&id, WatchdogPhase::Ack));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn stop_disarms_and_makes_firing_inert() {
        let (scheduler, mut watchdog) = watchdog();
        let id = TerminalId::new("t");
        watchdog.start(&id, WatchdogPhase::Prompt, WatchdogOptions::prompt());
        assert!(watchdog.stop(&id, WatchdogPhase::Prompt, "prompt seen"));

        assert!(scheduler.advance(Duration::from_secs(5)).is_empty());
        let stale = TimerKey {
            terminal_id: id.clone(),
            phase: WatchdogPhase::Prompt,
            generation: 0,
        };
        assert_eq!(watchdog.on_fire(&stale), None);
    }

    #[test]
    fn restart_invalidates_previous_generation() {
        let (scheduler, mut watchdog) = watchdog();
        let id = TerminalId::new("t");
        watchdog.start(&id, WatchdogPhase::Prompt, WatchdogOptions::prompt());
        let old_key = TimerKey {
            terminal_id: id.clone(),
            phase: WatchdogPhase::Prompt,
            generation: 0,
        };
        watchdog.start(&id, WatchdogPhase::Prompt, WatchdogOptions::prompt());

        assert_eq!(watchdog.on_fire(&old_key), None);
        let fired = scheduler.advance(Duration::from_millis(1000));
        assert_eq!(fired.len(), 1);
        let firing = watchdog.on_fire(&fired[0]).unwrap();
        assert!(firing.is_final_attempt);
    }

    #[test]
    fn phases_are_independent_per_terminal() {
        let (_scheduler, mut watchdog) = watchdog();
        let id = TerminalId::new("t");
        watchdog.start(&id, WatchdogPhase::Ack, WatchdogOptions::ack());
        watchdog.start(&id, WatchdogPhase::Prompt, WatchdogOptions::prompt());
        watchdog.stop(&id, WatchdogPhase::Ack, "acked");

        assert!(!watchdog.is_armed(&id, WatchdogPhase::Ack));
        assert!(watchdog.is_armed(&id, WatchdogPhase::Prompt));
        watchdog.stop_all(&id, "removed");
        assert!(!watchdog.is_armed(&id, WatchdogPhase::Prompt));
    }

    #[test]
    fn delay_for_uses_exponential_backoff() {
        let options = WatchdogOptions {
            initial_delay_ms: 100,
            max_attempts: 3,
            backoff_factor: 1.5,
        };
        assert_eq!(options.delay_for(1), Duration::from_millis(100));
        assert_eq!(options.delay_for(3), Duration::from_millis(225));
    }
}

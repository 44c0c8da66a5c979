//! Re-armable timer slots for the player core.
//!
//! Each [`TimerSlot`] holds at most one pending timer.  Arming a slot aborts
//! whatever was pending there and bumps the slot's generation; the timer task
//! sends [`TimerFired`] back onto the core's event channel, and the core only
//! acts on it if [`Scheduler::take_fired`] agrees the generation is current.
//! A firing that raced with a cancel or re-arm is therefore dropped even if it
//! was already queued.

use crate::core::PlayerEvent;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

/// Added to the server's time-to-next-change so the next poll lands after the
/// stream crossfade rather than just before the song boundary.
pub const FUDGE: Duration = Duration::from_millis(7_500);
pub const PAUSE_DEGRADE_DELAY: Duration = Duration::from_secs(15);
/// Fixed fallback after a failed quick poll.  Not subject to the fudge.
pub const RETRY_DELAY: Duration = Duration::from_secs(30);
pub const SWITCH_SETTLE_DELAY: Duration = Duration::from_millis(500);
pub const ENGINE_RECOVERY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerSlot {
    Update,
    PauseDegrade,
    SwitchSettle,
    EngineRecovery,
}

impl TimerSlot {
    const ALL: [TimerSlot; 4] = [
        TimerSlot::Update,
        TimerSlot::PauseDegrade,
        TimerSlot::SwitchSettle,
        TimerSlot::EngineRecovery,
    ];

    fn index(self) -> usize {
        match self {
            TimerSlot::Update => 0,
            TimerSlot::PauseDegrade => 1,
            TimerSlot::SwitchSettle => 2,
            TimerSlot::EngineRecovery => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub slot: TimerSlot,
    pub generation: u64,
}

struct Armed {
    generation: u64,
    delay: Duration,
    handle: AbortHandle,
}

pub struct Scheduler {
    slots: [Option<Armed>; 4],
    generation: u64,
    event_tx: mpsc::Sender<PlayerEvent>,
}

impl Scheduler {
    pub fn new(event_tx: mpsc::Sender<PlayerEvent>) -> Self {
        Self {
            slots: [None, None, None, None],
            generation: 0,
            event_tx,
        }
    }

    /// Cancel whatever is pending in `slot` and schedule a fresh firing.
    pub fn arm(&mut self, slot: TimerSlot, delay: Duration) {
        self.cancel(slot);
        self.generation += 1;
        let generation = self.generation;
        let tx = self.event_tx.clone();
        let deadline = tokio::time::Instant::now() + delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx
                .send(PlayerEvent::Timer(TimerFired { slot, generation }))
                .await;
        });
        debug!("timer {:?} armed for {:?} (gen {})", slot, delay, generation);
        self.slots[slot.index()] = Some(Armed {
            generation,
            delay,
            handle: task.abort_handle(),
        });
    }

    /// Next poll after the server-advertised seconds plus the fudge.
    /// Negative or non-finite input is treated as zero.
    pub fn arm_update(&mut self, next_poll_secs: f64) {
        let secs = if next_poll_secs.is_finite() {
            next_poll_secs.max(0.0)
        } else {
            0.0
        };
        self.arm(TimerSlot::Update, Duration::from_secs_f64(secs) + FUDGE);
    }

    pub fn arm_retry(&mut self) {
        self.arm(TimerSlot::Update, RETRY_DELAY);
    }

    /// Idempotent.  Cancelling an empty or already-fired slot is a no-op.
    pub fn cancel(&mut self, slot: TimerSlot) {
        if let Some(armed) = self.slots[slot.index()].take() {
            armed.handle.abort();
            debug!("timer {:?} cancelled (gen {})", slot, armed.generation);
        }
    }

    pub fn cancel_all(&mut self) {
        for slot in TimerSlot::ALL {
            self.cancel(slot);
        }
    }

    /// Accepts a firing only if it belongs to the currently armed timer of its
    /// slot, and clears the slot when it does.
    pub fn take_fired(&mut self, fired: TimerFired) -> bool {
        let entry = &mut self.slots[fired.slot.index()];
        match entry {
            Some(armed) if armed.generation == fired.generation => {
                *entry = None;
                true
            }
            _ => {
                debug!(
                    "timer {:?} gen {} is stale, ignoring",
                    fired.slot, fired.generation
                );
                false
            }
        }
    }

    pub fn is_armed(&self, slot: TimerSlot) -> bool {
        self.slots[slot.index()].is_some()
    }

    /// Delay the slot was last armed with, if it is still pending.
    pub fn armed_delay(&self, slot: TimerSlot) -> Option<Duration> {
        self.slots[slot.index()].as_ref().map(|a| a.delay)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

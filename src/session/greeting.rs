//! Greeting gate: when may caller audio reach the model?
//!
//! Early caller audio must not interrupt the greeting, but a stuck greeting
//! must never mute the call forever — every "No" branch has a failsafe.
//! Once the gate has opened it stays open for the rest of the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Failsafe: forward anyway if the greeting instruction never went out.
pub const INSTRUCTION_FAILSAFE: Duration = Duration::from_secs(5);

/// Failsafe: forward anyway if greeting audio never started.
pub const AUDIO_FAILSAFE: Duration = Duration::from_secs(5);

/// Hold-off after greeting audio starts, so the caller cannot cut the
/// greeting off in its first words.
pub const INTERRUPTION_WINDOW: Duration = Duration::from_secs(3);

pub struct GreetingGate {
    created: Instant,
    instruction_sent_at: Mutex<Option<Instant>>,
    audio_started_at: Mutex<Option<Instant>>,
    switched_to_realtime: AtomicBool,
}

impl GreetingGate {
    pub fn new(created: Instant) -> Self {
        Self {
            created,
            instruction_sent_at: Mutex::new(None),
            audio_started_at: Mutex::new(None),
            switched_to_realtime: AtomicBool::new(false),
        }
    }

    pub fn mark_instruction_sent(&self) {
        let mut sent = self.instruction_sent_at.lock();
        if sent.is_none() {
            *sent = Some(Instant::now());
        }
    }

    /// Greeting audio observed. Audio without a recorded instruction (the
    /// provider can be faster than our bookkeeping) backfills the
    /// instruction time so the ordering invariant holds.
    pub fn mark_audio_started(&self) {
        let now = Instant::now();
        {
            let mut sent = self.instruction_sent_at.lock();
            if sent.is_none() {
                *sent = Some(now);
            }
        }
        let mut started = self.audio_started_at.lock();
        if started.is_none() {
            *started = Some(now);
        }
    }

    pub fn mark_switched_to_realtime(&self) {
        self.switched_to_realtime.store(true, Ordering::SeqCst);
    }

    pub fn switched_to_realtime(&self) -> bool {
        self.switched_to_realtime.load(Ordering::SeqCst)
    }

    pub fn instruction_sent(&self) -> bool {
        self.instruction_sent_at.lock().is_some()
    }

    pub fn audio_started(&self) -> bool {
        self.audio_started_at.lock().is_some()
    }

    /// Decide whether caller audio may be forwarded at `now`. Every `true`
    /// decision latches the gate open — the answer is monotonic within a
    /// session.
    pub fn should_forward(&self, now: Instant) -> (bool, &'static str) {
        if self.switched_to_realtime() {
            return (true, "switched_to_realtime");
        }

        let instruction_sent_at = *self.instruction_sent_at.lock();
        let Some(instruction_sent_at) = instruction_sent_at else {
            if now.duration_since(self.created) < INSTRUCTION_FAILSAFE {
                return (false, "greeting_instruction_not_sent");
            }
            self.mark_switched_to_realtime();
            return (true, "failsafe_instruction_timeout");
        };

        let audio_started_at = *self.audio_started_at.lock();
        let Some(audio_started_at) = audio_started_at else {
            if now.duration_since(instruction_sent_at) < AUDIO_FAILSAFE {
                return (false, "greeting_audio_not_started");
            }
            self.mark_switched_to_realtime();
            return (true, "failsafe_audio_timeout");
        };

        if now.duration_since(audio_started_at) < INTERRUPTION_WINDOW {
            return (false, "greeting_interruption_window");
        }
        self.mark_switched_to_realtime();
        (true, "greeting_complete")
    }
}

// ── Tests ──────────────────────────────────────────────────────────

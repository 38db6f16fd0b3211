//! Deployment profiles and their tunables.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

// ── Characteristic shape ───────────────────────────────────────────────────

/// Maximum number of note bytes the characteristic holds.
pub const CAPACITY: usize = 20;

/// Primary service UUID: 51311102-030e-485f-b122-f8f381aa84ed
pub const SERVICE_UUID: u128 = 0x5131_1102_030e_485f_b122_f8f3_81aa_84ed;

/// Note characteristic UUID: 485f4145-52b9-4644-af1f-7a6b9322490f
pub const NOTE_CHAR_UUID: u128 = 0x485f_4145_52b9_4644_af1f_7a6b_9322_490f;

/// Payload pushed to subscribers right before a replay run.
pub const ANNOUNCE_PAYLOAD: [u8; 1] = [0x01];

// ── Timing ─────────────────────────────────────────────────────────────────

const FIXED_ON: Duration = Duration::from_millis(200);
const FIXED_OFF: Duration = Duration::from_millis(50);
const RANDOM_MIN: Duration = Duration::from_millis(50);
const RANDOM_MAX: Duration = Duration::from_millis(400);
const REPLAY_PERIOD: Duration = Duration::from_secs(2);

/// How long each note sounds and how long the gap after it lasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timing {
    Fixed {
        on: Duration,
        off: Duration,
    },
    /// Both holds are drawn uniformly from their range for every note.
    Random {
        on: RangeInclusive<Duration>,
        off: RangeInclusive<Duration>,
    },
}

impl Timing {
    pub fn fixed() -> Self {
        Timing::Fixed {
            on: FIXED_ON,
            off: FIXED_OFF,
        }
    }

    pub fn random() -> Self {
        Timing::Random {
            on: RANDOM_MIN..=RANDOM_MAX,
            off: RANDOM_MIN..=RANDOM_MAX,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Timing::fixed()
    }
}

/// When a stored sequence gets played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPolicy {
    /// One run right after each accepted write.
    OnWrite,
    /// One run every `period` over whatever is stored.
    Periodic { period: Duration },
}

impl TriggerPolicy {
    pub fn periodic() -> Self {
        TriggerPolicy::Periodic {
            period: REPLAY_PERIOD,
        }
    }
}

/// Which execution context drains the sequence to the buzzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// A dedicated playback thread fed through a single-slot mailbox.
    #[default]
    Worker,
    /// The calling event context plays the whole melody before returning.
    Inline,
}

/// Per-byte admission rule inherited from the clock-field firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueGate {
    /// Every byte must be below this.
    pub ceiling: u8,
    /// Bytes written to a bounded field must also be below this.
    pub bounded_ceiling: u8,
    /// Treat the note characteristic itself as a bounded field.
    pub bound_note_field: bool,
}

impl Default for ValueGate {
    fn default() -> Self {
        Self {
            ceiling: 60,
            bounded_ceiling: 24,
            bound_note_field: false,
        }
    }
}

// ── Profiles ───────────────────────────────────────────────────────────────

/// Named deployment presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    /// Replay the stored melody every two seconds, notifying subscribers first.
    #[default]
    Replay,
    /// Play once per write with randomized timing and indicator lines.
    Immediate,
    /// Play once per write, with the per-byte value gate switched on.
    Gated,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Replay => "replay",
            Profile::Immediate => "immediate",
            Profile::Gated => "gated",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown profile `{0}` (expected replay, immediate or gated)")]
pub struct UnknownProfile(pub String);

impl FromStr for Profile {
    type Err = UnknownProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replay" | "timer" => Ok(Profile::Replay),
            "immediate" | "write" => Ok(Profile::Immediate),
            "gated" => Ok(Profile::Gated),
            _ => Err(UnknownProfile(s.to_string())),
        }
    }
}

/// Everything the service needs to know at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub capacity: usize,
    pub trigger: TriggerPolicy,
    pub timing: Timing,
    pub dispatch: Dispatch,
    pub value_gate: Option<ValueGate>,
    /// Drive the three indicator lines while a note sounds.
    pub indicators: bool,
    /// Duty cycle for the "on" phase of each note.
    pub duty_percent: u8,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig::from(Profile::default())
    }
}

impl From<Profile> for ServiceConfig {
    fn from(profile: Profile) -> Self {
        let base = ServiceConfig {
            capacity: CAPACITY,
            trigger: TriggerPolicy::OnWrite,
            timing: Timing::fixed(),
            dispatch: Dispatch::Worker,
            value_gate: None,
            indicators: false,
            duty_percent: 50,
        };

        match profile {
            Profile::Replay => ServiceConfig {
                trigger: TriggerPolicy::periodic(),
                ..base
            },
            Profile::Immediate => ServiceConfig {
                timing: Timing::random(),
                indicators: true,
                ..base
            },
            Profile::Gated => ServiceConfig {
                value_gate: Some(ValueGate::default()),
                ..base
            },
        }
    }
}

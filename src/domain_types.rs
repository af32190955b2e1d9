//! Domain types for the hypha runtime
//!
//! This module defines strongly-typed domain values to prevent primitive
//! obsession and improve type safety throughout the codebase. Identifiers are
//! minted by [`crate::time::IdMinter`] from a process-wide counter, so their
//! textual form sorts in creation order.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Error returned when parsing a prefixed identifier from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid identifier `{input}`: expected `{prefix}-<16 hex digits>`")]
pub struct IdParseError {
    /// The offending input.
    pub input: String,
    /// The prefix the identifier type expects.
    pub prefix: &'static str,
}

macro_rules! prefixed_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[nutype(derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
            From,
            Into
        ))]
        pub struct $name(u64);

        impl $name {
            /// Stable textual prefix of this identifier type.
            pub const PREFIX: &'static str = $prefix;

            /// Gets the raw counter value.
            #[must_use]
            pub fn as_u64(&self) -> u64 {
                self.into_inner()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Fixed-width hex keeps lexicographic order equal to mint order.
                write!(f, "{}-{:016x}", Self::PREFIX, self.into_inner())
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let err = || IdParseError {
                    input: s.to_string(),
                    prefix: Self::PREFIX,
                };
                let rest = s.strip_prefix(Self::PREFIX).ok_or_else(err)?;
                let digits = rest.strip_prefix('-').ok_or_else(err)?;
                if digits.len() != 16 {
                    return Err(err());
                }
                let raw = u64::from_str_radix(digits, 16).map_err(|_| err())?;
                Ok(Self::new(raw))
            }
        }
    };
}

prefixed_id!(
    /// Unique identifier for a registered agent.
    AgentId,
    "agent"
);

prefixed_id!(
    /// Unique identifier for a message accepted by the bus.
    MessageId,
    "msg"
);

prefixed_id!(
    /// Unique identifier for an audited action.
    ActionId,
    "action"
);

/// Identifier propagated through a causal chain of messages.
///
/// Serves as the idempotency key agreed between sender and receiver; replies
/// and follow-ups copy it verbatim.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Creates a new random correlation ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Name of an agent
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    )
)]
pub struct AgentName(String);

/// A capability tag an agent declares it can serve
#[nutype(
    validate(len_char_min = 1, len_char_max = 100),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    )
)]
pub struct CapabilityName(String);

/// Content-type label attached to an opaque payload
#[nutype(
    validate(len_char_min = 1, len_char_max = 100),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct ContentType(String);

impl ContentType {
    /// The default label for raw byte payloads.
    ///
    /// # Panics
    ///
    /// Never panics; the literal is within length bounds.
    #[must_use]
    pub fn octet_stream() -> Self {
        Self::try_new("application/octet-stream".to_string()).expect("literal is valid")
    }

    /// The label for JSON payloads.
    ///
    /// # Panics
    ///
    /// Never panics; the literal is within length bounds.
    #[must_use]
    pub fn json() -> Self {
        Self::try_new("application/json".to_string()).expect("literal is valid")
    }
}

/// A point in time as observed by the runtime clock
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize
))]
pub struct Timestamp(SystemTime);

impl Timestamp {
    /// The UNIX epoch, useful as an obviously-stale sentinel in tests.
    #[must_use]
    pub fn epoch() -> Self {
        Self::new(UNIX_EPOCH)
    }

    /// Gets the inner `SystemTime`.
    #[must_use]
    pub fn as_system_time(&self) -> SystemTime {
        self.into_inner()
    }

    /// Returns this timestamp shifted forward by `duration`.
    #[must_use]
    pub fn saturating_add(&self, duration: Duration) -> Self {
        Self::new(
            self.into_inner()
                .checked_add(duration)
                .unwrap_or(self.into_inner()),
        )
    }

    /// Duration elapsed from `earlier` to `self`, zero if `earlier` is later.
    #[must_use]
    pub fn saturating_duration_since(&self, earlier: Timestamp) -> Duration {
        self.into_inner()
            .duration_since(earlier.into_inner())
            .unwrap_or(Duration::ZERO)
    }

    /// Nanoseconds since the UNIX epoch.
    #[must_use]
    pub fn as_epoch_nanos(&self) -> u128 {
        self.into_inner()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos()
    }
}

/// Delivery attempts recorded against a message
#[nutype(
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        From,
        Into
    ),
    default = 0
)]
pub struct AttemptCount(u8);

impl AttemptCount {
    /// No attempts yet.
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    /// Records one more attempt, saturating at `u8::MAX`.
    #[must_use]
    pub fn increment(&self) -> Self {
        Self::new(self.into_inner().saturating_add(1))
    }

    /// Gets the value as u8.
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.into_inner()
    }
}

/// Bounded capacity of a single agent inbox
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 256
)]
pub struct InboxCapacity(usize);

impl InboxCapacity {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Inbox depth above which the supervisor counts a health failure
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 128
)]
pub struct InboxSoftLimit(usize);

impl InboxSoftLimit {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum delivery attempts before a message is dead-lettered
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct MaxAttempts(u8);

impl MaxAttempts {
    /// Gets the value as u8.
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.into_inner()
    }
}

/// Restart attempts granted to a failing agent before it is declared dead
#[nutype(
    validate(less_or_equal = 64),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct MaxRestarts(u32);

impl MaxRestarts {
    /// Gets the value as u32.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Consecutive health failures that tip a degraded agent into failing
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct FailureThreshold(u32);

impl FailureThreshold {
    /// Gets the value as u32.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Consecutive healthy samples required to leave the degraded state
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 2
)]
pub struct RecoverySamples(u32);

impl RecoverySamples {
    /// Gets the value as u32.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Handler error rate (errors / handled) above which a health sample fails
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0.5
)]
pub struct ErrorRateCeiling(f64);

impl ErrorRateCeiling {
    /// Gets the value as f64.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Worker thread count for the runtime scheduler
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 32),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 4
)]
pub struct WorkerThreadCount(usize);

impl WorkerThreadCount {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Channel capacity for bounded internal queues
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1024
)]
pub struct ChannelCapacity(usize);

impl ChannelCapacity {
    /// Gets the value as usize for use with tokio channels.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum action records retained by the audit ring
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct AuditMaxRecords(usize);

impl AuditMaxRecords {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

macro_rules! millis_type {
    ($(#[$doc:meta])* $name:ident, $min:literal, $max:literal, $default:literal) => {
        $(#[$doc])*
        #[nutype(
            validate(greater_or_equal = $min, less_or_equal = $max),
            derive(
                Debug,
                Clone,
                Copy,
                PartialEq,
                Eq,
                PartialOrd,
                Ord,
                Serialize,
                Deserialize,
                Display,
                Default,
                TryFrom,
                Into
            ),
            default = $default
        )]
        pub struct $name(u64);

        impl $name {
            /// Converts to Duration.
            #[must_use]
            pub fn as_duration(&self) -> Duration {
                Duration::from_millis(self.into_inner())
            }

            /// Gets the value as u64.
            #[must_use]
            pub fn as_u64(&self) -> u64 {
                self.into_inner()
            }
        }
    };
}

millis_type!(
    /// How long a producer may block on a full inbox before `send` fails
    EnqueueTimeoutMs,
    1,
    60_000,
    1000
);

millis_type!(
    /// Time budget for a single handler invocation
    HandlerTimeoutMs,
    1,
    300_000,
    30_000
);

millis_type!(
    /// Cadence of the supervisor health poll
    HealthIntervalMs,
    10,
    300_000,
    5_000
);

millis_type!(
    /// Heartbeat age beyond which a health sample fails
    HeartbeatStalenessMs,
    100,
    3_600_000,
    60_000
);

millis_type!(
    /// Quiet period after which a running agent is marked idle
    IdleAfterMs,
    10,
    3_600_000,
    30_000
);

millis_type!(
    /// Base delay for message redelivery backoff
    RetryBaseMs,
    1,
    60_000,
    100
);

millis_type!(
    /// Upper bound on message redelivery backoff
    MaxBackoffMs,
    10,
    600_000,
    30_000
);

millis_type!(
    /// Base delay for agent restart backoff
    RestartBaseMs,
    1,
    60_000,
    100
);

millis_type!(
    /// Time granted to a stopping agent to drain its inbox
    DrainDeadlineMs,
    10,
    600_000,
    5_000
);

millis_type!(
    /// Global deadline for `shutdown_all`
    ShutdownDeadlineMs,
    100,
    600_000,
    10_000
);

millis_type!(
    /// Maximum age of a retained audit record
    AuditMaxAgeMs,
    1_000,
    604_800_000,
    86_400_000
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_display_is_sortable() {
        let a = AgentId::new(1);
        let b = AgentId::new(2);
        let c = AgentId::new(0x10);
        assert!(a.to_string() < b.to_string());
        assert!(b.to_string() < c.to_string());
        assert_eq!(a.to_string(), "agent-0000000000000001");
    }

    #[test]
    fn agent_id_round_trips_through_text() {
        let id = AgentId::new(42);
        let parsed: AgentId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn agent_id_rejects_malformed_text() {
        assert!("agent-zz".parse::<AgentId>().is_err());
        assert!("msg-0000000000000001".parse::<AgentId>().is_err());
        assert!("agent0000000000000001".parse::<AgentId>().is_err());
    }

    #[test]
    fn timestamp_arithmetic() {
        let t = Timestamp::epoch();
        let later = t.saturating_add(Duration::from_secs(5));
        assert_eq!(later.saturating_duration_since(t), Duration::from_secs(5));
        assert_eq!(t.saturating_duration_since(later), Duration::ZERO);
    }

    #[test]
    fn attempt_count_increments() {
        let mut attempts = AttemptCount::zero();
        attempts = attempts.increment();
        attempts = attempts.increment();
        assert_eq!(attempts.as_u8(), 2);
    }

    #[test]
    fn capability_name_validation() {
        assert!(CapabilityName::try_new("pay".to_string()).is_ok());
        assert!(CapabilityName::try_new(String::new()).is_err());
        assert!(CapabilityName::try_new("x".repeat(101)).is_err());
    }

    #[test]
    fn millis_types_convert_to_duration() {
        let timeout = HandlerTimeoutMs::try_new(1_500).unwrap();
        assert_eq!(timeout.as_duration(), Duration::from_millis(1_500));
    }
}

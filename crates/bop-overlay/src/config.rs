use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::time::Duration;

use crate::error::{OverlayError, OverlayResult};

/// Smallest metadata block the record layout can hold (headers plus a little
/// caller metadata).
pub const METADATA_BLOCK_MIN_BYTES: u32 = 256;

/// Default fixed size of a record's metadata block.
const DEFAULT_METADATA_BLOCK_BYTES: u32 = 4 * 1024; // 4 KiB

/// Default largest record the shared log accepts.
const DEFAULT_SHARED_MAX_RECORD_BYTES: u64 = 1024 * 1024; // 1 MiB

/// Default size a coalesced dedicated record grows to before it is flushed.
const DEFAULT_COALESCE_MAX_RECORD_BYTES: u64 = 512 * 1024; // 512 KiB

/// Flush once the active block is this full, rather than wait for an append
/// that will not fit.
const DEFAULT_FLUSH_THRESHOLD_PERCENT: u8 = 90;

/// Idle timer period for flushing a partially filled block.
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 10;

/// Process-wide ceiling on pending write buffers.
const DEFAULT_BUFFER_MEMORY_LIMIT: u64 = 256 * 1024 * 1024; // 256 MiB

const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 5;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 250;

/// Threshold value meaning "no dedicated write throttling".
pub const UNLIMITED_THROTTLE: u64 = u64::MAX;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            #[inline]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            #[inline]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }
    };
}

id_newtype!(
    /// Identity of a logical stream inside a container.
    StreamId
);

id_newtype!(
    /// Logical byte offset marking the start of a record within a stream.
    ///
    /// ```rust
    /// use bop_overlay::Asn;
    ///
    /// let asn = Asn::new(100);
    /// assert_eq!(asn.advance(28).get(), 128);
    /// ```
    Asn
);

id_newtype!(
    /// Per-stream monotonically increasing write counter.
    Version
);

impl Asn {
    /// The offset `bytes` past this one.
    #[inline]
    pub const fn advance(self, bytes: u64) -> Self {
        Self(self.0.saturating_add(bytes))
    }

    pub const MAX: Asn = Asn(u64::MAX);
}

impl Version {
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Bounded exponential backoff for transient physical failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before a transient dedicated failure becomes permanent.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = max_delay.as_millis() as u64;
        self
    }

    /// Delay before retry number `retries` (1-based), capped at `max_delay_ms`.
    pub fn backoff(&self, retries: u32) -> Duration {
        let cap = self.max_delay_ms.max(self.base_delay_ms);
        if retries == 0 {
            return Duration::from_millis(self.base_delay_ms.min(cap));
        }
        let shift = retries.saturating_sub(1).min(6);
        let base = self.base_delay_ms.saturating_mul(1u64 << shift);
        let jitter = crate::flush::jitter_millis(base.max(1));
        Duration::from_millis(base.saturating_add(jitter).min(cap))
    }
}

/// Write coalescing knobs for the dedicated log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalesceConfig {
    /// Coalescing starts enabled; `DisableCoalescingWrites` turns it off.
    pub enabled: bool,
    /// Largest coalesced dedicated record, also the size above which a single
    /// write bypasses coalescing.
    pub max_record_bytes: u64,
    /// Flush once the active block reaches this share of `max_record_bytes`.
    pub flush_threshold_percent: u8,
    /// Idle timer period (0 disables the timer).
    pub flush_interval_ms: u64,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_record_bytes: DEFAULT_COALESCE_MAX_RECORD_BYTES,
            flush_threshold_percent: DEFAULT_FLUSH_THRESHOLD_PERCENT,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
        }
    }
}

impl CoalesceConfig {
    pub fn with_max_record_bytes(mut self, bytes: u64) -> Self {
        self.max_record_bytes = bytes;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Byte count at which the active block is flushed eagerly.
    pub fn flush_threshold_bytes(&self) -> u64 {
        (self.max_record_bytes as u128 * self.flush_threshold_percent as u128 / 100) as u64
    }

    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_ms > 0).then(|| Duration::from_millis(self.flush_interval_ms))
    }

    pub fn validate(&self) -> OverlayResult<()> {
        if self.max_record_bytes == 0 {
            return Err(OverlayError::invalid_parameter(
                "coalesce max_record_bytes must be non-zero",
            ));
        }
        if self.flush_threshold_percent == 0 || self.flush_threshold_percent > 100 {
            return Err(OverlayError::invalid_parameter(format!(
                "flush_threshold_percent {} outside 1..=100",
                self.flush_threshold_percent
            )));
        }
        Ok(())
    }
}

/// Container-level configuration shared by every stream of a [`crate::LogOverlay`].
///
/// # Example
///
/// ```rust
/// use bop_overlay::{CoalesceConfig, OverlayConfig};
/// use std::time::Duration;
///
/// let config = OverlayConfig::default()
///     .with_shared_max_record_bytes(64 * 1024)
///     .with_coalesce(CoalesceConfig::default().with_flush_interval(Duration::from_millis(2)));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Records above this size never go to the shared log.
    pub shared_max_record_bytes: u64,
    /// Fixed size of each record's metadata block.
    pub metadata_block_bytes: u32,
    /// Ceiling enforced by the [`crate::ThrottledBufferAllocator`].
    pub buffer_memory_limit: u64,
    /// How long a write may wait for buffer memory (`None` waits forever).
    pub allocation_timeout_ms: Option<u64>,
    /// Initial per-stream dedicated write throttle threshold.
    pub default_write_throttle: u64,
    pub coalesce: CoalesceConfig,
    pub retry: RetryPolicy,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            shared_max_record_bytes: DEFAULT_SHARED_MAX_RECORD_BYTES,
            metadata_block_bytes: DEFAULT_METADATA_BLOCK_BYTES,
            buffer_memory_limit: DEFAULT_BUFFER_MEMORY_LIMIT,
            allocation_timeout_ms: None,
            default_write_throttle: UNLIMITED_THROTTLE,
            coalesce: CoalesceConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl OverlayConfig {
    pub fn with_shared_max_record_bytes(mut self, bytes: u64) -> Self {
        self.shared_max_record_bytes = bytes;
        self
    }

    pub fn with_metadata_block_bytes(mut self, bytes: u32) -> Self {
        self.metadata_block_bytes = bytes;
        self
    }

    pub fn with_buffer_memory_limit(mut self, bytes: u64) -> Self {
        self.buffer_memory_limit = bytes;
        self
    }

    pub fn with_allocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.allocation_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_default_write_throttle(mut self, bytes: u64) -> Self {
        self.default_write_throttle = bytes;
        self
    }

    pub fn with_coalesce(mut self, coalesce: CoalesceConfig) -> Self {
        self.coalesce = coalesce;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn allocation_timeout(&self) -> Option<Duration> {
        self.allocation_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> OverlayResult<()> {
        if self.metadata_block_bytes < METADATA_BLOCK_MIN_BYTES {
            return Err(OverlayError::invalid_parameter(format!(
                "metadata_block_bytes {} below minimum {}",
                self.metadata_block_bytes, METADATA_BLOCK_MIN_BYTES
            )));
        }
        if self.buffer_memory_limit == 0 {
            return Err(OverlayError::invalid_parameter(
                "buffer_memory_limit must be non-zero",
            ));
        }
        if self.default_write_throttle == 0 {
            return Err(OverlayError::invalid_parameter(
                "default_write_throttle must be non-zero",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(OverlayError::invalid_parameter(
                "retry max_attempts must be at least 1",
            ));
        }
        self.coalesce.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = OverlayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_write_throttle, UNLIMITED_THROTTLE);
        assert!(config.coalesce.enabled);
    }

    #[test]
    fn version_next_saturates() {
        assert_eq!(Version::new(7).next(), Version::new(8));
        assert_eq!(Version::new(u64::MAX).next(), Version::new(u64::MAX));
    }

    #[test]
    fn config_builder() {
        let config = OverlayConfig::default()
            .with_shared_max_record_bytes(8192)
            .with_buffer_memory_limit(1 << 20)
            .with_allocation_timeout(Some(Duration::from_millis(50)))
            .with_coalesce(
                CoalesceConfig::default()
                    .with_max_record_bytes(4096)
                    .with_flush_interval(Duration::ZERO),
            );
        assert_eq!(config.shared_max_record_bytes, 8192);
        assert_eq!(config.allocation_timeout(), Some(Duration::from_millis(50)));
        assert_eq!(config.coalesce.flush_interval(), None);
        assert_eq!(config.coalesce.flush_threshold_bytes(), 3686);
    }

    #[test]
    fn validation_rejects_tiny_metadata_block() {
        let config = OverlayConfig::default().with_metadata_block_bytes(16);
        assert!(matches!(
            config.validate(),
            Err(OverlayError::InvalidParameter(_))
        ));
    }

    #[test]
    fn retry_backoff_is_bounded() {
        let policy = RetryPolicy::default();
        let first = policy.backoff(1);
        let later = policy.backoff(10);
        assert!(first >= Duration::from_millis(policy.base_delay_ms));
        assert!(later <= Duration::from_millis(policy.max_delay_ms));
    }

    #[test]
    fn ids_roundtrip_through_json() {
        let asn = Asn::new(4096);
        let encoded = serde_json::to_string(&asn).expect("encode");
        assert_eq!(encoded, "4096");
        let decoded: Asn = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, asn);
    }
}

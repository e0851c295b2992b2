//! Runtime configuration consumed by the client.
//!
//! [`ClientConfig`] is a plain value type. Binaries build it from CLI flags or
//! environment variables and call [`ClientConfig::validate`] (the client does
//! so again on construction).

use crate::{ChannelId, Error, Result, classification_code};
use core::time::Duration;

/// Which signal representation the server should attach to each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RawDataType {
    /// No signal, metadata only.
    None,
    /// Signal scaled to picoamps.
    #[default]
    Calibrated,
    /// Raw ADC values.
    Uncalibrated,
    /// Keep whatever the previous setup requested.
    KeepPrevious,
}

/// Stream parameters sent to the server when streaming begins, and again
/// whenever they are reconfigured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSetup {
    /// First channel to stream, inclusive.
    pub first_channel: ChannelId,
    /// Last channel to stream, inclusive.
    pub last_channel: ChannelId,
    pub raw_data_type: RawDataType,
    /// Smallest chunk, in samples, the server should emit.
    pub min_chunk_size: u64,
}

impl Default for StreamSetup {
    fn default() -> Self {
        Self {
            first_channel: 1,
            last_channel: 512,
            raw_data_type: RawDataType::Calibrated,
            min_chunk_size: 0,
        }
    }
}

impl StreamSetup {
    /// Number of channels covered by the setup.
    pub const fn channel_count(&self) -> usize {
        (self.last_channel - self.first_channel + 1) as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.first_channel == 0 {
            return Err(Error::InvalidConfig {
                reason: "channel numbering starts at 1".to_string(),
            });
        }
        if self.last_channel < self.first_channel {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "last channel ({}) is below first channel ({})",
                    self.last_channel, self.first_channel
                ),
            });
        }
        Ok(())
    }
}

/// What the cache does with a newer chunk of an item it already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// The newest chunk replaces the slot.
    #[default]
    Replace,
    /// Chunks of the same item are concatenated in sequence order.
    Accumulate { on_out_of_order: OutOfOrderPolicy },
}

/// Handling of a chunk whose sequence does not advance past the cached one
/// while accumulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutOfOrderPolicy {
    /// Discard the chunk and count the anomaly.
    #[default]
    Drop,
    /// Throw away what was accumulated and start over from this chunk.
    Replace,
}

/// Reconnection behavior after a transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Reconnect attempts allowed before the session is declared dead.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): the initial backoff
    /// doubled per prior attempt, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Full client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub setup: StreamSetup,
    pub cache_mode: CacheMode,
    /// Cadence of the outbound action loop.
    pub dispatch_interval: Duration,
    /// Largest number of actions sent in one message.
    pub max_batch_size: usize,
    /// Pending count that wakes the outbound loop before its next tick.
    pub batch_threshold: usize,
    /// Bound on unsent actions; `None` means unbounded.
    pub max_pending: Option<usize>,
    pub reconnect: ReconnectPolicy,
    /// How long a sent action may wait for its acknowledgment.
    pub action_timeout: Duration,
    /// Cadence of the timeout sweeper.
    pub sweep_interval: Duration,
    /// Stage a stop-further-data action for every new item as soon as its
    /// first chunk arrives.
    pub one_chunk: bool,
    /// Only cache chunks carrying one of these classification codes. Empty
    /// accepts everything.
    pub prefilter_classes: Vec<i32>,
    /// Send still-pending actions one last time when stopping.
    pub drain_on_stop: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            setup: StreamSetup::default(),
            cache_mode: CacheMode::default(),
            dispatch_interval: Duration::from_millis(1),
            max_batch_size: 1000,
            batch_threshold: 1000,
            max_pending: None,
            reconnect: ReconnectPolicy::default(),
            action_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(500),
            one_chunk: false,
            prefilter_classes: Vec::new(),
            drain_on_stop: true,
        }
    }
}

impl ClientConfig {
    /// Sets the prefilter from classification names such as `"strand"`.
    pub fn with_prefilter_names<I, S>(mut self, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.prefilter_classes = names
            .into_iter()
            .map(|name| {
                let name = name.as_ref();
                classification_code(name).ok_or_else(|| Error::InvalidConfig {
                    reason: format!("unknown read classification '{name}'"),
                })
            })
            .collect::<Result<_>>()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.setup.validate()?;

        let invalid = |reason: &str| {
            Err(Error::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if self.max_batch_size == 0 {
            return invalid("max batch size must be greater than 0");
        }
        if self.batch_threshold == 0 {
            return invalid("batch threshold must be greater than 0");
        }
        if self.max_pending == Some(0) {
            return invalid("max pending must be greater than 0 when set");
        }
        if self.dispatch_interval.is_zero() {
            return invalid("dispatch interval must be non-zero");
        }
        if self.sweep_interval.is_zero() {
            return invalid("sweep interval must be non-zero");
        }
        if self.action_timeout.is_zero() {
            return invalid("action timeout must be non-zero");
        }
        if self.reconnect.initial_backoff > self.reconnect.max_backoff {
            return invalid("initial backoff exceeds max backoff");
        }
        Ok(())
    }
}

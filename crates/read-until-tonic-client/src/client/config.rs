use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use core::time::Duration;
use read_until::{
    CacheMode, ClientConfig, OutOfOrderPolicy, RawDataType, ReconnectPolicy, StreamSetup,
};
use tonic::codec::CompressionEncoding;

/// Runtime configuration for the `read-until-tonic-client` binary.
///
/// Every flag can also be set through the environment variable named next to
/// it, or through a `.env` file in the working directory.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "read-until-tonic-client",
    version,
    about = "Streams live reads over gRPC and ejects the ones analysis rejects"
)]
pub struct CliArgs {
    /// gRPC endpoint of the acquisition server.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("http://127.0.0.1:8000"))]
    pub server_addr: String,

    /// Timeout for establishing the connection, in milliseconds.
    ///
    /// Environment variable: `CONNECT_TIMEOUT_MS`
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 5_000)]
    pub connect_timeout_ms: u64,

    /// Compression applied to both directions of the stream.
    ///
    /// Environment variable: `COMPRESSION`
    #[arg(long, env = "COMPRESSION", value_enum, default_value_t = Compression::None)]
    pub compression: Compression,

    /// Capacity of the buffer between the client and the request stream.
    ///
    /// Environment variable: `REQUEST_BUFFER_SIZE`
    #[arg(long, env = "REQUEST_BUFFER_SIZE", default_value_t = 64)]
    pub request_buffer_size: usize,

    /// First channel to stream, inclusive.
    ///
    /// Environment variable: `FIRST_CHANNEL`
    #[arg(long, env = "FIRST_CHANNEL", default_value_t = 1)]
    pub first_channel: u32,

    /// Last channel to stream, inclusive.
    ///
    /// Environment variable: `LAST_CHANNEL`
    #[arg(long, env = "LAST_CHANNEL", default_value_t = 512)]
    pub last_channel: u32,

    /// Signal representation attached to each chunk.
    ///
    /// Environment variable: `RAW_DATA_TYPE`
    #[arg(long, env = "RAW_DATA_TYPE", value_enum, default_value_t = RawData::Calibrated)]
    pub raw_data_type: RawData,

    /// Smallest chunk, in samples, the server should send.
    ///
    /// Environment variable: `MIN_CHUNK_SIZE`
    #[arg(long, env = "MIN_CHUNK_SIZE", default_value_t = 0)]
    pub min_chunk_size: u64,

    /// Concatenate chunks of the same read instead of keeping only the newest.
    ///
    /// Environment variable: `ACCUMULATE`
    #[arg(long, env = "ACCUMULATE", default_value_t = false)]
    pub accumulate: bool,

    /// What to do with an out-of-order chunk while accumulating.
    ///
    /// Environment variable: `ON_OUT_OF_ORDER`
    #[arg(long, env = "ON_OUT_OF_ORDER", value_enum, default_value_t = OutOfOrder::Drop)]
    pub on_out_of_order: OutOfOrder,

    /// Cadence of the action dispatcher, in milliseconds.
    ///
    /// Environment variable: `DISPATCH_INTERVAL_MS`
    #[arg(long, env = "DISPATCH_INTERVAL_MS", default_value_t = 1)]
    pub dispatch_interval_ms: u64,

    /// Largest number of actions sent in one request.
    ///
    /// Environment variable: `MAX_BATCH_SIZE`
    #[arg(long, env = "MAX_BATCH_SIZE", default_value_t = 1000)]
    pub max_batch_size: usize,

    /// Queued action count that triggers a dispatch ahead of the cadence.
    ///
    /// Environment variable: `BATCH_THRESHOLD`
    #[arg(long, env = "BATCH_THRESHOLD", default_value_t = 1000)]
    pub batch_threshold: usize,

    /// Bound on queued, unsent actions. Unbounded when omitted.
    ///
    /// Environment variable: `MAX_PENDING`
    #[arg(long, env = "MAX_PENDING")]
    pub max_pending: Option<usize>,

    /// Give up on the first transport failure instead of reconnecting.
    ///
    /// Environment variable: `NO_RECONNECT`
    #[arg(long, env = "NO_RECONNECT", default_value_t = false)]
    pub no_reconnect: bool,

    /// Reconnect attempts before the session is declared dead.
    ///
    /// Environment variable: `MAX_RETRIES`
    #[arg(long, env = "MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,

    /// First reconnect delay in milliseconds; doubles per attempt.
    ///
    /// Environment variable: `INITIAL_BACKOFF_MS`
    #[arg(long, env = "INITIAL_BACKOFF_MS", default_value_t = 100)]
    pub initial_backoff_ms: u64,

    /// Upper bound on the reconnect delay in milliseconds.
    ///
    /// Environment variable: `MAX_BACKOFF_MS`
    #[arg(long, env = "MAX_BACKOFF_MS", default_value_t = 5_000)]
    pub max_backoff_ms: u64,

    /// How long a sent action may wait for its acknowledgment, in milliseconds.
    ///
    /// Environment variable: `ACTION_TIMEOUT_MS`
    #[arg(long, env = "ACTION_TIMEOUT_MS", default_value_t = 5_000)]
    pub action_timeout_ms: u64,

    /// Cadence of the acknowledgment timeout sweep, in milliseconds.
    ///
    /// Environment variable: `SWEEP_INTERVAL_MS`
    #[arg(long, env = "SWEEP_INTERVAL_MS", default_value_t = 500)]
    pub sweep_interval_ms: u64,

    /// Stop each read after its first chunk.
    ///
    /// Environment variable: `ONE_CHUNK`
    #[arg(long, env = "ONE_CHUNK", default_value_t = false)]
    pub one_chunk: bool,

    /// Read classifications worth analysing, comma separated.
    ///
    /// Environment variable: `PREFILTER_CLASSES`
    #[arg(
        long,
        env = "PREFILTER_CLASSES",
        value_delimiter = ',',
        default_value = "strand,adapter"
    )]
    pub prefilter_classes: Vec<String>,

    /// Analyse every chunk regardless of its classification.
    ///
    /// Environment variable: `NO_PREFILTER`
    #[arg(long, env = "NO_PREFILTER", default_value_t = false)]
    pub no_prefilter: bool,

    /// Drop queued actions on shutdown instead of sending them.
    ///
    /// Environment variable: `NO_DRAIN`
    #[arg(long, env = "NO_DRAIN", default_value_t = false)]
    pub no_drain: bool,

    /// Time allowed for a graceful stop before the stream is aborted, in
    /// milliseconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_MS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_MS", default_value_t = 3_000)]
    pub shutdown_timeout_ms: u64,

    /// Number of concurrent analysis workers.
    ///
    /// Environment variable: `WORKERS`
    #[arg(long, env = "WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Delay before analysis starts, in milliseconds.
    ///
    /// Environment variable: `ANALYSIS_DELAY_MS`
    #[arg(long, env = "ANALYSIS_DELAY_MS", default_value_t = 1_000)]
    pub analysis_delay_ms: u64,

    /// Minimum interval between two polls of the cache, in milliseconds.
    ///
    /// Environment variable: `THROTTLE_MS`
    #[arg(long, env = "THROTTLE_MS", default_value_t = 100)]
    pub throttle_ms: u64,

    /// Drop in median current, in pA, that marks a read as decided.
    ///
    /// Environment variable: `MEDIAN_DROP`
    #[arg(long, env = "MEDIAN_DROP", default_value_t = 60.0)]
    pub median_drop: f32,

    /// Eject reads that fail the median test. Without it they are left alone.
    ///
    /// Environment variable: `UNBLOCK`
    #[arg(long, env = "UNBLOCK", default_value_t = false)]
    pub unblock: bool,

    /// Channel reversal time for ejections, in milliseconds.
    ///
    /// Environment variable: `UNBLOCK_DURATION_MS`
    #[arg(long, env = "UNBLOCK_DURATION_MS", default_value_t = 100)]
    pub unblock_duration_ms: u64,

    /// Stop after this many seconds. Runs until interrupted when 0.
    ///
    /// Environment variable: `RUN_TIME_SECS`
    #[arg(long, env = "RUN_TIME_SECS", default_value_t = 0)]
    pub run_time_secs: u64,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Deflate,
    Zstd,
}

impl From<Compression> for Option<CompressionEncoding> {
    fn from(value: Compression) -> Self {
        match value {
            Compression::None => None,
            Compression::Gzip => Some(CompressionEncoding::Gzip),
            Compression::Deflate => Some(CompressionEncoding::Deflate),
            Compression::Zstd => Some(CompressionEncoding::Zstd),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawData {
    None,
    Calibrated,
    Uncalibrated,
    KeepPrevious,
}

impl From<RawData> for RawDataType {
    fn from(value: RawData) -> Self {
        match value {
            RawData::None => Self::None,
            RawData::Calibrated => Self::Calibrated,
            RawData::Uncalibrated => Self::Uncalibrated,
            RawData::KeepPrevious => Self::KeepPrevious,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutOfOrder {
    Drop,
    Replace,
}

/// Connection settings for the gRPC transport.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub server_addr: String,
    pub connect_timeout: Duration,
    pub compression: Option<CompressionEncoding>,
    pub request_buffer_size: usize,
}

/// Settings for the demonstration analysis loop.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub workers: usize,
    pub delay: Duration,
    pub throttle: Duration,
    pub median_drop: f32,
    /// Unblock duration for reads that fail the median test; `None` leaves
    /// them alone.
    pub unblock: Option<Duration>,
}

/// Fully validated application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub client: ClientConfig,
    pub analysis: AnalysisConfig,
    pub shutdown_timeout: Duration,
    pub run_time: Option<Duration>,
}

impl TryFrom<CliArgs> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.server_addr.is_empty() {
            bail!("SERVER_ADDR must not be empty");
        }
        if args.request_buffer_size == 0 {
            bail!("REQUEST_BUFFER_SIZE must be greater than 0");
        }
        if args.workers == 0 {
            bail!("WORKERS must be greater than 0");
        }
        if args.throttle_ms == 0 {
            bail!("THROTTLE_MS must be greater than 0");
        }
        if !args.median_drop.is_finite() {
            bail!("MEDIAN_DROP must be a finite number");
        }

        let cache_mode = if args.accumulate {
            CacheMode::Accumulate {
                on_out_of_order: match args.on_out_of_order {
                    OutOfOrder::Drop => OutOfOrderPolicy::Drop,
                    OutOfOrder::Replace => OutOfOrderPolicy::Replace,
                },
            }
        } else {
            CacheMode::Replace
        };

        let client = ClientConfig {
            setup: StreamSetup {
                first_channel: args.first_channel,
                last_channel: args.last_channel,
                raw_data_type: args.raw_data_type.into(),
                min_chunk_size: args.min_chunk_size,
            },
            cache_mode,
            dispatch_interval: Duration::from_millis(args.dispatch_interval_ms),
            max_batch_size: args.max_batch_size,
            batch_threshold: args.batch_threshold,
            max_pending: args.max_pending,
            reconnect: ReconnectPolicy {
                enabled: !args.no_reconnect,
                max_retries: args.max_retries,
                initial_backoff: Duration::from_millis(args.initial_backoff_ms),
                max_backoff: Duration::from_millis(args.max_backoff_ms),
            },
            action_timeout: Duration::from_millis(args.action_timeout_ms),
            sweep_interval: Duration::from_millis(args.sweep_interval_ms),
            one_chunk: args.one_chunk,
            prefilter_classes: Vec::new(),
            drain_on_stop: !args.no_drain,
        };

        let client = if args.no_prefilter {
            client
        } else {
            client
                .with_prefilter_names(args.prefilter_classes.iter().map(|c| c.trim()))
                .context("invalid PREFILTER_CLASSES")?
        };

        // Surface the library's own checks (channel range, non-zero cadences,
        // backoff ordering) as configuration errors.
        if let Err(e) = client.validate() {
            bail!("{e}");
        }

        Ok(Self {
            connection: ConnectionConfig {
                server_addr: args.server_addr,
                connect_timeout: Duration::from_millis(args.connect_timeout_ms),
                compression: args.compression.into(),
                request_buffer_size: args.request_buffer_size,
            },
            client,
            analysis: AnalysisConfig {
                workers: args.workers,
                delay: Duration::from_millis(args.analysis_delay_ms),
                throttle: Duration::from_millis(args.throttle_ms),
                median_drop: args.median_drop,
                unblock: args
                    .unblock
                    .then(|| Duration::from_millis(args.unblock_duration_ms)),
            },
            shutdown_timeout: Duration::from_millis(args.shutdown_timeout_ms),
            run_time: (args.run_time_secs > 0).then(|| Duration::from_secs(args.run_time_secs)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<AppConfig> {
        let args = CliArgs::try_parse_from(
            core::iter::once("read-until-tonic-client").chain(args.iter().copied()),
        )?;
        AppConfig::try_from(args)
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.client.setup, StreamSetup::default());
        assert_eq!(config.client.prefilter_classes, vec![83, 65]);
        assert_eq!(config.client.cache_mode, CacheMode::Replace);
        assert!(config.client.drain_on_stop);
        assert!(config.analysis.unblock.is_none());
        assert!(config.run_time.is_none());
    }

    #[test]
    fn flags_map_onto_client_config() {
        let config = parse(&[
            "--first-channel",
            "10",
            "--last-channel",
            "20",
            "--accumulate",
            "--on-out-of-order",
            "replace",
            "--no-prefilter",
            "--unblock",
            "--unblock-duration-ms",
            "250",
            "--max-pending",
            "64",
        ])
        .unwrap();

        assert_eq!(config.client.setup.first_channel, 10);
        assert_eq!(config.client.setup.last_channel, 20);
        assert_eq!(
            config.client.cache_mode,
            CacheMode::Accumulate {
                on_out_of_order: OutOfOrderPolicy::Replace
            }
        );
        assert!(config.client.prefilter_classes.is_empty());
        assert_eq!(config.client.max_pending, Some(64));
        assert_eq!(config.analysis.unblock, Some(Duration::from_millis(250)));
    }

    #[test]
    fn rejects_inverted_channel_range() {
        assert!(parse(&["--first-channel", "9", "--last-channel", "3"]).is_err());
    }

    #[test]
    fn rejects_unknown_classification() {
        let err = parse(&["--prefilter-classes", "strand,bogus"]).unwrap_err();
        assert!(format!("{err:#}").contains("bogus"));
    }

    #[test]
    fn rejects_zero_workers() {
        assert!(parse(&["--workers", "0"]).is_err());
    }
}

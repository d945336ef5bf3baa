//! Engine configuration (§4.10): a builder-style struct the host constructs
//! in Rust and passes to the orchestrator. Not a file format — the crate
//! does not parse or load configuration from disk.
use std::time::Duration;

/// Tunables for the PE transaction engine and CI discovery manager.
///
/// Defaults match every value named in the spec: 2s request-ID cooldown,
/// 2 in-flight requests per device, 5s discovery interval, 15s device
/// timeout, 500ms reply assembly timeout, 5s notify assembly timeout, and a
/// 128-byte zlib+Mcoded7 compression threshold.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub(crate) request_id_cooldown: Duration,
    pub(crate) max_inflight_per_device: usize,
    pub(crate) discovery_interval: Duration,
    pub(crate) device_timeout: Duration,
    pub(crate) reply_assembly_timeout: Duration,
    pub(crate) notify_assembly_timeout: Duration,
    pub(crate) compression_threshold: usize,
    pub(crate) ble_timeout_multiplier: u32,
    pub(crate) cleanup_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            request_id_cooldown: crate::reqid::DEFAULT_COOLDOWN,
            max_inflight_per_device: 2,
            discovery_interval: Duration::from_secs(5),
            device_timeout: Duration::from_secs(15),
            reply_assembly_timeout: crate::chunk::DEFAULT_REPLY_TIMEOUT,
            notify_assembly_timeout: crate::chunk::DEFAULT_NOTIFY_TIMEOUT,
            compression_threshold: 128,
            ble_timeout_multiplier: 1,
            cleanup_interval: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    /// Construct a config with every default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the request-ID post-release cooldown (`Duration::ZERO`
    /// disables it).
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.request_id_cooldown = cooldown;
        self
    }

    /// Override the per-device in-flight PE request cap.
    pub fn with_max_inflight(mut self, max_inflight_per_device: usize) -> Self {
        self.max_inflight_per_device = max_inflight_per_device.max(1);
        self
    }

    /// Override the Discovery Inquiry broadcast interval.
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Override how long a discovered device may go unheard from before
    /// it's evicted.
    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }

    /// Override both the PE reply and notify chunk-assembly timeouts.
    pub fn with_assembly_timeout(mut self, reply: Duration, notify: Duration) -> Self {
        self.reply_assembly_timeout = reply;
        self.notify_assembly_timeout = notify;
        self
    }

    /// Stretch every PE timeout by this factor, as BLE transports need
    /// (§6.1). `1` is a no-op.
    pub fn with_ble_timeout_multiplier(mut self, multiplier: u32) -> Self {
        self.ble_timeout_multiplier = multiplier.max(1);
        self
    }

    /// Override the zlib+Mcoded7 compression threshold in bytes.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Override the coarse polling interval used for transaction and
    /// chunk-assembly deadline sweeps (§9 "Timers").
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// The request-ID cooldown.
    pub fn cooldown(&self) -> Duration {
        self.request_id_cooldown
    }

    /// The per-device in-flight cap.
    pub fn max_inflight_per_device(&self) -> usize {
        self.max_inflight_per_device
    }

    /// The discovery broadcast interval.
    pub fn discovery_interval(&self) -> Duration {
        self.discovery_interval
    }

    /// The device eviction timeout.
    pub fn device_timeout(&self) -> Duration {
        self.device_timeout
    }

    /// Scale a caller-supplied timeout by the configured BLE multiplier.
    pub fn scale_timeout(&self, timeout: Duration) -> Duration {
        timeout * self.ble_timeout_multiplier
    }
}

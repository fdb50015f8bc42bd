use std::env;
use std::time::Duration;

/// Controller configuration.
///
/// Reads the listen address from the `EYES_LISTEN_ADDR` environment variable,
/// falling back to `0.0.0.0:12121` when unset.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Address the agent listener binds to.
    pub listen_addr: String,
    /// Capacity of the bounded result channel shared by all sessions.
    pub result_channel_capacity: usize,
    /// Capacity of the bounded disconnect channel shared by all sessions.
    pub disconnect_channel_capacity: usize,
    /// Largest handshake frame accepted from a new connection.
    pub handshake_max_frame_length: usize,
    /// Largest result frame accepted on an established session.
    pub max_frame_length: usize,
    /// Expire pending callbacks older than this. `None` keeps them forever.
    pub pending_ttl: Option<Duration>,
    /// How often the result dispatcher checks for expired callbacks.
    pub pending_sweep_interval: Duration,
}

impl ControllerConfig {
    /// The listen address used when no environment variable is set.
    pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:12121";
    pub const DEFAULT_RESULT_CHANNEL_CAPACITY: usize = 10;
    pub const DEFAULT_DISCONNECT_CHANNEL_CAPACITY: usize = 5;
    pub const DEFAULT_HANDSHAKE_MAX_FRAME_LENGTH: usize = 4096;
    pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024;

    /// Build a config with every default and the given listen address.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            result_channel_capacity: Self::DEFAULT_RESULT_CHANNEL_CAPACITY,
            disconnect_channel_capacity: Self::DEFAULT_DISCONNECT_CHANNEL_CAPACITY,
            handshake_max_frame_length: Self::DEFAULT_HANDSHAKE_MAX_FRAME_LENGTH,
            max_frame_length: Self::DEFAULT_MAX_FRAME_LENGTH,
            pending_ttl: None,
            pending_sweep_interval: Duration::from_secs(1),
        }
    }

    /// Build a config from the environment.
    ///
    /// Priority: `EYES_LISTEN_ADDR` env var, then the compile-time default.
    pub fn from_env() -> Self {
        let listen_addr =
            env::var("EYES_LISTEN_ADDR").unwrap_or_else(|_| Self::DEFAULT_LISTEN_ADDR.to_owned());
        Self::new(listen_addr)
    }

    pub fn with_channel_capacities(mut self, results: usize, disconnects: usize) -> Self {
        self.result_channel_capacity = results.max(1);
        self.disconnect_channel_capacity = disconnects.max(1);
        self
    }

    pub fn with_pending_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.pending_ttl = ttl;
        self
    }

    pub fn with_pending_sweep_interval(mut self, interval: Duration) -> Self {
        self.pending_sweep_interval = interval;
        self
    }

    pub fn with_max_frame_lengths(mut self, handshake: usize, session: usize) -> Self {
        self.handshake_max_frame_length = handshake;
        self.max_frame_length = session;
        self
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

use std::time::Duration;

/// Configuration for a [`Transport`](crate::Transport) and the endpoints it creates.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum number of live endpoints. Default: 1024. Capped at 65536.
    pub max_endpoints: usize,
    /// Maximum connections per endpoint, pending ones included. Default and cap: 65536.
    pub max_connections_per_endpoint: usize,
    /// Maximum registered RMA regions per endpoint. Default and cap: 65536.
    pub max_regions_per_endpoint: usize,
    /// Regions spanning more pages than this keep their page list in
    /// fixed-size chunks instead of one contiguous vector. Default: 4096.
    pub large_region_threshold_pages: usize,
    /// Connect timeout used when a connect call passes none. Default: wait forever.
    pub default_connect_timeout: Option<Duration>,
    /// Inbound messages are dropped once this many events are queued.
    /// Completion events are never dropped. Default: 65536.
    pub max_queued_events: usize,
    /// Allow a loopback interface to be chosen as the default interface.
    pub allow_loopback: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_endpoints: 1024,
            max_connections_per_endpoint: 65536,
            max_regions_per_endpoint: 65536,
            large_region_threshold_pages: 4096,
            default_connect_timeout: None,
            max_queued_events: 65536,
            allow_loopback: false,
        }
    }
}

impl TransportConfig {
    pub fn with_max_endpoints(mut self, max: usize) -> Self {
        self.max_endpoints = max;
        self
    }

    pub fn with_max_connections_per_endpoint(mut self, max: usize) -> Self {
        self.max_connections_per_endpoint = max;
        self
    }

    pub fn with_max_regions_per_endpoint(mut self, max: usize) -> Self {
        self.max_regions_per_endpoint = max;
        self
    }

    pub fn with_large_region_threshold_pages(mut self, pages: usize) -> Self {
        self.large_region_threshold_pages = pages;
        self
    }

    pub fn with_default_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_connect_timeout = timeout;
        self
    }

    pub fn with_max_queued_events(mut self, max: usize) -> Self {
        self.max_queued_events = max;
        self
    }

    pub fn with_allow_loopback(mut self, allow: bool) -> Self {
        self.allow_loopback = allow;
        self
    }
}

use std::time::Duration;

use gatehub_proto::codec::DEFAULT_MAX_PAYLOAD;

/// Gateway-side configuration.
///
/// Defaults match production: a 60 second heartbeat window swept every
/// 10 seconds, 5 minute grace for routing state after disconnect, and a
/// shared execution pool sized for tens of thousands of idle sessions.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Sessions whose last read/write is older than this are evicted
    pub heartbeat_timeout: Duration,
    /// Grace period before a disconnected session's routing state is dropped
    pub cleanup_delay: Duration,
    /// Pipeline workers idle longer than this are evicted
    pub pipeline_idle_timeout: Duration,
    /// Queue depth of each pipeline worker
    pub pipeline_buffer: usize,
    /// Maximum wire payload size; over-sized frames close the connection
    pub max_payload: usize,
    /// Concurrency bound of the shared worker pool
    pub worker_pool_size: usize,
    /// Idle request/reply objects retained for reuse
    pub object_pool_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            cleanup_delay: Duration::from_secs(5 * 60),
            pipeline_idle_timeout: Duration::from_secs(5 * 60),
            pipeline_buffer: 100,
            max_payload: DEFAULT_MAX_PAYLOAD,
            worker_pool_size: 10_000,
            object_pool_size: 1024,
        }
    }
}

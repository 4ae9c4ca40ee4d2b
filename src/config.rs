//! Node configuration.

use std::time::Duration;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Queue-size hint passed to the datastore with every lookup.
pub const DEFAULT_DATASTORE_QUEUE_SIZE: u32 = 1024;

/// Ceiling on requests that carry an expiration deadline.
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 32 * 1024;

/// Store content received from peers in the local datastore.
pub const DEFAULT_CONTENT_CACHING: bool = true;

/// Delay anonymous replies to defeat timing correlation.
pub const DEFAULT_RANDOMIZED_DELAYS: bool = true;

/// Queries are dropped when the requester already has this many replies queued.
pub const DEFAULT_MAX_QUEUE_PER_PEER: u32 = 16;

/// Outbound queries waiting in a single peer's send queue.
pub const DEFAULT_MAX_PENDING_QUERIES_PER_PEER: u32 = 32;

/// Interval at which the cover-traffic counters decay by 15/16.
pub const DEFAULT_COVER_AGE_FREQUENCY: Duration = Duration::from_secs(5);

/// Interval of the pending-table maintenance sweep.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Local lookups running longer than this are logged (repeatedly).
pub const DEFAULT_LOOKUP_WARNING_INTERVAL: Duration = Duration::from_secs(60);

/// Interval at which changed respect values are written to the peerstore.
pub const DEFAULT_RESPECT_FLUSH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Replication level requested for DHT lookups.
pub const DEFAULT_DHT_REPLICATION: u32 = 5;

/// Direct-peer lookup attempts before giving up.
pub const DEFAULT_CADET_RETRY_MAX: u32 = 3;

/// Capacity of the command channel feeding the dispatch actor.
pub const DEFAULT_COMMAND_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct FsConfig {
    // ========================================================================
    // Datastore
    // ========================================================================
    /// Queue-size hint for datastore operations.
    pub datastore_queue_size: u32,
    /// Cache content pushed or returned by peers.
    pub content_caching: bool,

    // ========================================================================
    // Admission control
    // ========================================================================
    /// Maximum number of expiring pending requests.
    pub max_pending_requests: usize,
    /// Maximum queued replies (immediate + delayed) towards one peer before
    /// that peer's queries are dropped.
    pub max_queue_per_peer: u32,
    /// Maximum queued queries towards one peer.
    pub max_pending_queries_per_peer: u32,

    // ========================================================================
    // Anonymity
    // ========================================================================
    /// Route anonymous replies through the artificial-delay tier.
    pub randomized_delays: bool,
    /// Decay interval of the cover-traffic counters.
    pub cover_age_frequency: Duration,

    // ========================================================================
    // Lookups
    // ========================================================================
    pub dht_replication: u32,
    pub cadet_retry_max: u32,
    pub lookup_warning_interval: Duration,

    // ========================================================================
    // Housekeeping
    // ========================================================================
    pub maintenance_interval: Duration,
    pub respect_flush_interval: Duration,
    pub command_channel_capacity: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            datastore_queue_size: DEFAULT_DATASTORE_QUEUE_SIZE,
            content_caching: DEFAULT_CONTENT_CACHING,

            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            max_queue_per_peer: DEFAULT_MAX_QUEUE_PER_PEER,
            max_pending_queries_per_peer: DEFAULT_MAX_PENDING_QUERIES_PER_PEER,

            randomized_delays: DEFAULT_RANDOMIZED_DELAYS,
            cover_age_frequency: DEFAULT_COVER_AGE_FREQUENCY,

            dht_replication: DEFAULT_DHT_REPLICATION,
            cadet_retry_max: DEFAULT_CADET_RETRY_MAX,
            lookup_warning_interval: DEFAULT_LOOKUP_WARNING_INTERVAL,

            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            respect_flush_interval: DEFAULT_RESPECT_FLUSH_INTERVAL,
            command_channel_capacity: DEFAULT_COMMAND_CHANNEL_CAPACITY,
        }
    }
}

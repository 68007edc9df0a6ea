use std::time::Duration;

use anyhow::bail;

use crate::messaging::group_id::GroupId;


#[derive(Debug, Clone)]
pub struct MulticastConfig {
    pub group: GroupId,

    /// a message of at least this size (in bytes) is sent in a bundle of its own, immediately
    pub max_bundling_message_size: usize,
    /// maximum time a message waits in the send queue before it is sent in a (partial) bundle
    pub max_bundling_period: Duration,
    /// once this many bytes are waiting to be bundled, a bundle is sent immediately
    pub max_bundle_size: usize,

    /// maximum time before received messages are acknowledged if there is no outgoing traffic
    ///  to piggyback the acknowledgement on. This is also the time after which a new completion
    ///  watermark is sent in a dedicated message.
    pub max_unacknowledged_period: Duration,
    /// number of unacknowledged messages from a sender that triggers an immediate acknowledgement
    pub max_unacknowledged_message_count: u64,
    /// a receive queue that has been empty and without traffic for this long is discarded
    pub max_idle_receive_queue_period: Duration,

    /// retain sent and received messages until they are completed, allowing retransmission
    ///  after a sender's failure. Without this, messages are fire-and-forget.
    pub durable: bool,
    /// deliver messages in a single global order across all senders
    pub ordered: bool,

    /// a locked queue unlocks when its buffered bytes drop to this value
    pub max_unlock_queue_capacity: usize,
    /// a queue locks when its buffered bytes reach this value
    pub min_lock_queue_capacity: usize,
    /// how far (in message ids or global orders) data may run ahead of a queue's start before it
    ///  is rejected as a protocol violation
    pub max_receive_window: u64,

    /// interval at which the coordinator broadcasts newly assigned orders
    pub order_info_period: Duration,
    /// resolution of the processing loop's timer
    pub tick_interval: Duration,
}

impl MulticastConfig {
    pub fn new(group: GroupId) -> MulticastConfig {
        MulticastConfig {
            group,
            max_bundling_message_size: 10_000,
            max_bundling_period: Duration::from_millis(100),
            max_bundle_size: 100_000,
            max_unacknowledged_period: Duration::from_millis(100),
            max_unacknowledged_message_count: 100,
            max_idle_receive_queue_period: Duration::from_secs(600),
            durable: true,
            ordered: false,
            max_unlock_queue_capacity: 10_000_000,
            min_lock_queue_capacity: 20_000_000,
            max_receive_window: 100_000,
            order_info_period: Duration::from_millis(50),
            tick_interval: Duration::from_millis(10),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_bundling_message_size == 0 || self.max_bundle_size == 0 {
            bail!("bundling thresholds must be positive");
        }
        if self.max_receive_window == 0 {
            bail!("max_receive_window must be positive");
        }
        if self.max_unacknowledged_message_count == 0 {
            bail!("max_unacknowledged_message_count must be positive");
        }
        for (name, period) in [
            ("max_bundling_period", self.max_bundling_period),
            ("max_unacknowledged_period", self.max_unacknowledged_period),
            ("max_idle_receive_queue_period", self.max_idle_receive_queue_period),
            ("order_info_period", self.order_info_period),
            ("tick_interval", self.tick_interval),
        ] {
            if period.is_zero() {
                bail!("{} must not be zero", name);
            }
        }
        if self.max_unlock_queue_capacity > self.min_lock_queue_capacity {
            bail!("max_unlock_queue_capacity ({}) must not exceed min_lock_queue_capacity ({})",
                self.max_unlock_queue_capacity, self.min_lock_queue_capacity);
        }

        Ok(())
    }
}

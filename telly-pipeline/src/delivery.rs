use std::collections::HashMap;

use parking_lot::Mutex;
use telly_metric::{DeliveryInfo, TrackingId};

/// Source messages awaiting delivery, keyed by the tracking ID of their metric group.
///
/// Inputs reading from a queue insert the message handle when they add a tracking group and
/// resolve it once the [`DeliveryInfo`] arrives, acknowledging or requeueing the message
/// depending on the outcome. Notifications for unknown IDs are logged and ignored.
#[derive(Debug)]
pub struct PendingDeliveries<T> {
    pending: Mutex<HashMap<TrackingId, T>>,
}

impl<T> PendingDeliveries<T> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Registers the source of a delivery group.
    pub fn insert(&self, id: TrackingId, source: T) {
        if self.pending.lock().insert(id, source).is_some() {
            telly_log::warn!(tracking_id = id.value(), "replaced pending delivery");
        }
    }

    /// Removes and returns the source of a completed delivery group.
    pub fn resolve(&self, info: &DeliveryInfo) -> Option<T> {
        let source = self.pending.lock().remove(&info.id());
        if source.is_none() {
            telly_log::warn!(
                tracking_id = info.id().value(),
                delivered = info.delivered(),
                "delivery notification for unknown tracking id"
            );
        }
        source
    }

    /// Returns the number of pending deliveries.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns `true` if no delivery is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl<T> Default for PendingDeliveries<T> {
    fn default() -> Self {
        Self::new()
    }
}

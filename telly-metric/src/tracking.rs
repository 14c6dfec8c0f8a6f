//! Delivery tracking for metrics.
//!
//! A tracked metric carries a handle to a shared *delivery group*. Every copy of the metric holds
//! one reference in the group's outstanding counter and must eventually be settled with exactly
//! one of [`Metric::accept`], [`Metric::reject`] or [`Metric::discard`]. Once the counter drops
//! to zero, the group's notification callback fires once with a [`DeliveryInfo`].
//!
//! The group counts as delivered if no copy was rejected. Discarded copies are neutral.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::Metric;

static NEXT_TRACKING_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a delivery group.
///
/// Identifiers are allocated from a process-wide sequence and are never reused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TrackingId(u64);

impl TrackingId {
    /// Allocates the next identifier.
    pub fn next() -> Self {
        Self(NEXT_TRACKING_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The outcome of a delivery group, reported once all copies are settled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeliveryInfo {
    id: TrackingId,
    delivered: bool,
}

impl DeliveryInfo {
    /// Returns the identifier of the delivery group.
    pub fn id(&self) -> TrackingId {
        self.id
    }

    /// Returns `true` if no copy of the group was rejected.
    pub fn delivered(&self) -> bool {
        self.delivered
    }
}

/// Callback invoked once a delivery group completes.
pub type NotifyFn = dyn Fn(DeliveryInfo) + Send + Sync;

struct DeliveryGroup {
    id: TrackingId,
    outstanding: AtomicUsize,
    rejected: AtomicUsize,
    notify: Box<NotifyFn>,
}

impl DeliveryGroup {
    fn new(notify: Box<NotifyFn>) -> Self {
        Self {
            id: TrackingId::next(),
            outstanding: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            notify,
        }
    }

    fn incr(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    fn decr(&self) {
        // The decrement that observes one is the last settled copy.
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        (self.notify)(DeliveryInfo {
            id: self.id,
            delivered: self.rejected.load(Ordering::Acquire) == 0,
        });
    }
}

/// Handle of one metric copy within a delivery group.
///
/// Cloning a tracker registers another outstanding copy before the clone is returned, so the
/// group cannot complete while a copy is being made.
pub(crate) struct Tracker {
    group: Arc<DeliveryGroup>,
}

impl Tracker {
    fn new(group: Arc<DeliveryGroup>) -> Self {
        group.incr();
        Self { group }
    }

    pub(crate) fn id(&self) -> TrackingId {
        self.group.id
    }

    pub(crate) fn accept(self) {
        self.group.decr();
    }

    pub(crate) fn reject(self) {
        self.group.rejected.fetch_add(1, Ordering::AcqRel);
        self.group.decr();
    }

    pub(crate) fn discard(self) {
        self.group.decr();
    }
}

impl Clone for Tracker {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.group))
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("id", &self.group.id)
            .field("outstanding", &self.group.outstanding.load(Ordering::Relaxed))
            .finish()
    }
}

/// Attaches delivery tracking to a single metric.
///
/// Returns the tracked metric and the identifier of its delivery group. Any tracking the metric
/// carried before is superseded and its group will never complete.
pub fn track<F>(metric: Metric, notify: F) -> (Metric, TrackingId)
where
    F: Fn(DeliveryInfo) + Send + Sync + 'static,
{
    let mut metric = metric;
    let group = Arc::new(DeliveryGroup::new(Box::new(notify)));
    let id = group.id;
    metric.tracker = Some(Tracker::new(group));
    (metric, id)
}

/// Attaches one shared delivery group to all metrics produced from the same source event.
///
/// The notification fires once every metric of the group, and every copy made from them, has
/// been settled. An empty group completes immediately as delivered.
pub fn track_group<F>(metrics: Vec<Metric>, notify: F) -> (Vec<Metric>, TrackingId)
where
    F: Fn(DeliveryInfo) + Send + Sync + 'static,
{
    let group = Arc::new(DeliveryGroup::new(Box::new(notify)));
    let id = group.id;

    if metrics.is_empty() {
        group.finish();
        return (metrics, id);
    }

    // Register all copies before handing out any of them, so an early settle cannot complete
    // the group prematurely.
    let trackers: Vec<_> = metrics
        .iter()
        .map(|_| Tracker::new(Arc::clone(&group)))
        .collect();

    let metrics = metrics
        .into_iter()
        .zip(trackers)
        .map(|(mut metric, tracker)| {
            metric.tracker = Some(tracker);
            metric
        })
        .collect();

    (metrics, id)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};

    use super::*;

    fn metric() -> Metric {
        Metric::new(
            "cpu",
            [("host", "a")],
            [("value", 42)],
            Utc.timestamp_opt(0, 0).unwrap(),
        )
    }

    fn recorder() -> (Arc<Mutex<Vec<DeliveryInfo>>>, impl Fn(DeliveryInfo) + Send + Sync) {
        let infos = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&infos);
        (infos, move |info| sink.lock().unwrap().push(info))
    }

    #[test]
    fn test_accept_and_reject_is_not_delivered() {
        let (infos, notify) = recorder();
        let (a, id) = track(metric(), notify);
        let b = a.clone();

        a.accept();
        assert!(infos.lock().unwrap().is_empty());
        b.reject();

        let infos = infos.lock().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id(), id);
        assert!(!infos[0].delivered());
    }

    #[test]
    fn test_accept_and_discard_is_delivered() {
        let (infos, notify) = recorder();
        let (a, _) = track(metric(), notify);
        let b = a.clone();

        a.accept();
        b.discard();

        let infos = infos.lock().unwrap();
        assert_eq!(infos.len(), 1);
        assert!(infos[0].delivered());
    }

    #[test]
    fn test_copy_after_partial_settle() {
        let (infos, notify) = recorder();
        let (metrics, _) = track_group(vec![metric(), metric()], notify);
        let mut metrics = metrics.into_iter();
        let first = metrics.next().unwrap();
        let second = metrics.next().unwrap();

        first.accept();
        let copy = second.clone();
        second.accept();
        assert!(infos.lock().unwrap().is_empty());

        copy.reject();
        let infos = infos.lock().unwrap();
        assert_eq!(infos.len(), 1);
        assert!(!infos[0].delivered());
    }

    #[test]
    fn test_untracked_copy_does_not_hold_group() {
        let (infos, notify) = recorder();
        let (a, _) = track(metric(), notify);
        let copy = a.untracked_copy();

        a.accept();
        assert_eq!(infos.lock().unwrap().len(), 1);
        assert!(copy.tracking_id().is_none());
    }

    #[test]
    fn test_empty_group_completes_immediately() {
        let (infos, notify) = recorder();
        let (metrics, id) = track_group(Vec::new(), notify);
        assert!(metrics.is_empty());

        let infos = infos.lock().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id(), id);
        assert!(infos[0].delivered());
    }

    #[test]
    fn test_all_dispositions_across_copies() {
        // Every combination of three settle kinds across three copies.
        for mask in 0..27u32 {
            let (infos, notify) = recorder();
            let (a, _) = track(metric(), notify);
            let copies = [a.clone(), a.clone(), a];

            let mut any_reject = false;
            for (i, copy) in copies.into_iter().enumerate() {
                match (mask / 3u32.pow(i as u32)) % 3 {
                    0 => copy.accept(),
                    1 => {
                        any_reject = true;
                        copy.reject();
                    }
                    _ => copy.discard(),
                }
            }

            let infos = infos.lock().unwrap();
            assert_eq!(infos.len(), 1);
            assert_eq!(infos[0].delivered(), !any_reject, "mask {mask}");
        }
    }

    #[test]
    fn test_tracking_ids_unique_across_threads() {
        let spawn = || std::thread::spawn(|| (0..100_000).map(|_| TrackingId::next()).collect());
        let a: Vec<TrackingId> = spawn().join().unwrap();
        let b: Vec<TrackingId> = spawn().join().unwrap();

        let mut seen = HashSet::with_capacity(a.len() + b.len());
        for id in a.into_iter().chain(b) {
            assert!(seen.insert(id), "duplicate tracking id {id}");
        }
        assert_eq!(seen.len(), 200_000);
    }
}

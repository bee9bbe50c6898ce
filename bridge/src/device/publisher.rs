//! Fan-out publisher
//!
//! Observers are called synchronously, in registration order, once per
//! batch. Changes staged between two flushes are coalesced so an observer
//! only ever sees the latest view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::trace;

use crate::device::machine::DeviceView;
use crate::model::telemetry::ChangeSet;

/// Receives change batches. Implementations should be cheap; they run on
/// the device task.
pub trait Observer: Send + Sync {
    fn on_change(&self, view: &DeviceView, changes: ChangeSet);
}

impl<F> Observer for F
where
    F: Fn(&DeviceView, ChangeSet) + Send + Sync,
{
    fn on_change(&self, view: &DeviceView, changes: ChangeSet) {
        self(view, changes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

pub struct Publisher {
    observers: Mutex<Vec<(ObserverId, Arc<dyn Observer>)>>,
    next_id: AtomicU64,
    staged: Mutex<ChangeSet>,
    latest: watch::Sender<Arc<DeviceView>>,
}

impl Publisher {
    pub fn new(initial: DeviceView) -> Self {
        let (latest, _) = watch::channel(Arc::new(initial));
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            staged: Mutex::new(ChangeSet::default()),
            latest,
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.observers).push((id, observer));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = lock(&self.observers);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.observers).len()
    }

    /// Accumulate changes for the next flush.
    pub fn stage(&self, changes: ChangeSet) {
        let mut staged = lock(&self.staged);
        *staged = staged.union(changes);
    }

    /// Deliver everything staged since the last flush as one batch.
    pub fn flush(&self, view: DeviceView) -> bool {
        let changes = std::mem::take(&mut *lock(&self.staged));
        if changes.is_empty() {
            return false;
        }
        self.publish(view, changes);
        true
    }

    /// Deliver one batch to every observer.
    pub fn publish(&self, view: DeviceView, changes: ChangeSet) {
        let view = Arc::new(view);
        self.latest.send_replace(view.clone());

        // Observers may (un)subscribe from inside the callback.
        let observers: Vec<Arc<dyn Observer>> = lock(&self.observers)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        trace!("{}: publishing {:?} to {} observers", view.id, changes.groups(), observers.len());
        for observer in observers {
            observer.on_change(&view, changes);
        }
    }

    pub fn latest(&self) -> Arc<DeviceView> {
        self.latest.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<DeviceView>> {
        self.latest.subscribe()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::telemetry::Group;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, ChangeSet)>>,
    }

    impl Observer for Recorder {
        fn on_change(&self, view: &DeviceView, changes: ChangeSet) {
            self.calls.lock().unwrap().push((view.id.clone(), changes));
        }
    }

    #[test]
    fn test_flush_coalesces_staged_changes() {
        let publisher = Publisher::new(DeviceView::empty("p"));
        let recorder = Arc::new(Recorder::default());
        publisher.subscribe(recorder.clone());

        publisher.stage(ChangeSet::default().with(Group::Temperatures));
        publisher.stage(ChangeSet::default().with(Group::Status));
        assert!(publisher.flush(DeviceView::empty("p")));
        assert!(!publisher.flush(DeviceView::empty("p")));

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.contains(Group::Temperatures));
        assert!(calls[0].1.contains(Group::Status));
    }

    #[test]
    fn test_registration_order_and_unsubscribe() {
        let publisher = Publisher::new(DeviceView::empty("p"));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = order.clone();
        let a = publisher.subscribe(Arc::new(move |_: &DeviceView, _: ChangeSet| {
            first.lock().unwrap().push("a")
        }));
        let second = order.clone();
        publisher.subscribe(Arc::new(move |_: &DeviceView, _: ChangeSet| {
            second.lock().unwrap().push("b")
        }));

        publisher.publish(DeviceView::empty("p"), ChangeSet::all());
        assert!(publisher.unsubscribe(a));
        assert!(!publisher.unsubscribe(a));
        publisher.publish(DeviceView::empty("p"), ChangeSet::all());

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "b"]);
        assert_eq!(publisher.observer_count(), 1);
    }

    #[test]
    fn test_latest_tracks_published_view() {
        let publisher = Publisher::new(DeviceView::empty("before"));
        let rx = publisher.watch();
        publisher.publish(DeviceView::empty("after"), ChangeSet::all());
        assert_eq!(publisher.latest().id, "after");
        assert_eq!(rx.borrow().id, "after");
    }
}

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;

/// Anything that can live in a [`Registry`].
pub trait Named {
    fn name(&self) -> &str;
}

/// A batched change notification. Each event carries exactly the entries
/// touched by one `add` or `remove` call, in registry order.
pub enum RegistryEvent<T> {
    Added(Vec<Arc<T>>),
    Removed(Vec<Arc<T>>),
}

impl<T> Clone for RegistryEvent<T> {
    fn clone(&self) -> Self {
        match self {
            RegistryEvent::Added(entries) => RegistryEvent::Added(entries.clone()),
            RegistryEvent::Removed(entries) => RegistryEvent::Removed(entries.clone()),
        }
    }
}

impl<T: Named> fmt::Debug for RegistryEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, entries) = match self {
            RegistryEvent::Added(e) => ("Added", e),
            RegistryEvent::Removed(e) => ("Removed", e),
        };
        f.debug_tuple(kind)
            .field(&entries.iter().map(|e| e.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Ordered, observable collection of plugin instances.
///
/// The same type backs sources, filters and recorders; it knows nothing about
/// their lifecycles. Whoever needs to react to changes calls [`subscribe`]
/// and acts on the events.
///
/// Mutations and snapshots are serialised by one lock, so a snapshot sees the
/// registry either before or after an `add`/`remove`, never halfway. Events
/// are sent while the write lock is held, so every subscriber observes them
/// in mutation order.
///
/// [`subscribe`]: Registry::subscribe
pub struct Registry<T> {
    inner: RwLock<Inner<T>>,
}

struct Inner<T> {
    entries: Vec<Arc<T>>,
    subscribers: Vec<mpsc::UnboundedSender<RegistryEvent<T>>>,
}

impl<T> Inner<T> {
    fn emit(&mut self, event: RegistryEvent<T>) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl<T: Named> Registry<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: Vec::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Receive every future add/remove batch.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.write().subscribers.push(tx);
        rx
    }

    /// Append entries in the given order and emit one `Added` event.
    /// Adding nothing emits nothing.
    pub fn add<I>(&self, entries: I) -> Vec<Arc<T>>
    where
        I: IntoIterator<Item = Arc<T>>,
    {
        let added: Vec<Arc<T>> = entries.into_iter().collect();
        if added.is_empty() {
            return added;
        }
        let mut inner = self.write();
        inner.entries.extend(added.iter().cloned());
        inner.emit(RegistryEvent::Added(added.clone()));
        added
    }

    pub fn add_one(&self, entry: T) -> Arc<T> {
        let entry = Arc::new(entry);
        self.add([Arc::clone(&entry)]);
        entry
    }

    /// Append `entry` unless an entry with the same name is registered.
    /// The name check and the insert happen under one write lock; a
    /// rejected entry is handed back.
    pub fn add_unique(&self, entry: T) -> Result<Arc<T>, T> {
        let mut inner = self.write();
        if inner.entries.iter().any(|e| e.name() == entry.name()) {
            return Err(entry);
        }
        let entry = Arc::new(entry);
        inner.entries.push(Arc::clone(&entry));
        inner.emit(RegistryEvent::Added(vec![Arc::clone(&entry)]));
        Ok(entry)
    }

    /// Remove every entry the matcher accepts and emit one `Removed` event
    /// with exactly those entries. Nothing matched, nothing emitted.
    pub fn remove<F>(&self, mut matcher: F) -> Vec<Arc<T>>
    where
        F: FnMut(&T) -> bool,
    {
        let mut inner = self.write();
        let (removed, kept): (Vec<_>, Vec<_>) =
            inner.entries.drain(..).partition(|entry| matcher(&**entry));
        inner.entries = kept;
        if !removed.is_empty() {
            inner.emit(RegistryEvent::Removed(removed.clone()));
        }
        removed
    }

    pub fn remove_named(&self, name: &str) -> Vec<Arc<T>> {
        self.remove(|entry| entry.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.read()
            .entries
            .iter()
            .find(|entry| entry.name() == name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Current entries in registration order. Later mutations do not
    /// affect the returned vector.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.read().entries.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.read()
            .entries
            .iter()
            .map(|entry| entry.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Named> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[derive(Debug)]
    struct Entry(String);

    impl Named for Entry {
        fn name(&self) -> &str {
            &self.0
        }
    }

    fn entry(name: &str) -> Arc<Entry> {
        Arc::new(Entry(name.to_string()))
    }

    fn names(entries: &[Arc<Entry>]) -> Vec<&str> {
        entries.iter().map(|e| e.name()).collect()
    }

    #[test]
    fn add_emits_one_batch_in_order() {
        let registry = Registry::new();
        let mut events = registry.subscribe();

        registry.add([entry("a"), entry("b")]);

        match events.try_recv().unwrap() {
            RegistryEvent::Added(added) => assert_eq!(names(&added), ["a", "b"]),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err(), "exactly one event per add");
        assert_eq!(registry.names(), ["a", "b"]);
    }

    #[test]
    fn remove_emits_exactly_the_removed_entries() {
        let registry = Registry::new();
        registry.add([entry("a"), entry("b"), entry("c")]);
        let mut events = registry.subscribe();

        let removed = registry.remove_named("b");
        assert_eq!(names(&removed), ["b"]);

        match events.try_recv().unwrap() {
            RegistryEvent::Removed(removed) => assert_eq!(names(&removed), ["b"]),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(registry.names(), ["a", "c"]);
    }

    #[test]
    fn removing_nothing_is_silent() {
        let registry = Registry::new();
        registry.add([entry("a")]);
        let mut events = registry.subscribe();

        assert!(registry.remove_named("zzz").is_empty());
        assert!(registry.add(Vec::new()).is_empty());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn add_unique_admits_one_of_many_racing_names() {
        let registry = Registry::new();
        let mut events = registry.subscribe();
        let barrier = std::sync::Barrier::new(8);

        let admitted: usize = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        registry.add_unique(Entry("cam".into())).is_ok()
                    })
                })
                .collect();
            handles.into_iter().map(|h| usize::from(h.join().unwrap())).sum()
        });

        assert_eq!(admitted, 1);
        assert_eq!(registry.names(), ["cam"]);
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::Added(added)) if added.len() == 1));
        assert!(events.try_recv().is_err());

        let rejected = registry.add_unique(Entry("cam".into())).unwrap_err();
        assert_eq!(rejected.name(), "cam");
        assert!(registry.add_unique(Entry("gate".into())).is_ok());
    }

    #[test]
    fn duplicates_by_identity_are_allowed() {
        let registry = Registry::new();
        let a = entry("a");
        registry.add([Arc::clone(&a), Arc::clone(&a)]);
        assert_eq!(registry.len(), 2);

        let removed = registry.remove(|e| std::ptr::eq(e, &*a));
        assert_eq!(removed.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_stable_across_mutation() {
        let registry = Registry::new();
        registry.add([entry("a"), entry("b")]);
        let snapshot = registry.snapshot();
        registry.remove_named("a");
        registry.add([entry("c")]);
        assert_eq!(names(&snapshot), ["a", "b"]);
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let registry: Registry<Entry> = Registry::new();
        let events = registry.subscribe();
        drop(events);
        registry.add([entry("a")]);
        assert!(registry.read().subscribers.is_empty());
    }

    #[test]
    fn concurrent_snapshots_never_see_partial_remove() {
        let registry = Arc::new(Registry::new());
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let registry = Arc::clone(&registry);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for _ in 0..2_000 {
                    registry.add([entry("x"), entry("y")]);
                    registry.remove(|e| e.name() == "x" || e.name() == "y");
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        registry.add([entry("base")]);
        while !done.load(Ordering::SeqCst) {
            let snapshot = registry.snapshot();
            let x = snapshot.iter().filter(|e| e.name() == "x").count();
            let y = snapshot.iter().filter(|e| e.name() == "y").count();
            assert_eq!(x, y, "snapshot observed a half-applied batch");
        }
        writer.join().unwrap();
    }
}

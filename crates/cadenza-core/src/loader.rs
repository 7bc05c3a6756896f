//! Background construction of heavy, immutable resources.
//!
//! [`AsyncLoader`] runs a construction closure on a named worker thread and
//! publishes the result once. The control thread can poll
//! ([`is_loaded`](AsyncLoader::is_loaded), [`error`](AsyncLoader::error)) or
//! block ([`wait`](AsyncLoader::wait)). Processors never read a loader
//! directly: they [`subscribe`](AsyncLoader::subscribe) a [`Staged`] slot
//! and take the resource at the top of `process`.
//!
//! [`AsyncLoader::shared`] adds process-wide singleton semantics keyed by
//! resource type and name: the first caller starts the worker, later callers
//! get the same loader while any of them holds it, and the registry entry is
//! torn down with the last handle.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};

use crate::error::LoadError;
use crate::staged::Staged;

type RegistryKey = (TypeId, String);
type Registry = HashMap<RegistryKey, Weak<dyn Any + Send + Sync>>;

static SHARED_LOADERS: LazyLock<Mutex<Registry>> = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Completion record and late subscribers, behind one lock.
struct Outcome<T> {
    result: Option<Result<Arc<T>, LoadError>>,
    subscribers: Vec<Weak<Staged<T>>>,
}

/// State shared between the handle and the worker thread.
struct LoadState<T> {
    name: String,
    resource: ArcSwapOption<T>,
    finished: AtomicBool,
    outcome: Mutex<Outcome<T>>,
    ready: Condvar,
}

impl<T> LoadState<T> {
    fn complete(&self, result: Result<T, LoadError>) {
        let mut outcome = self.outcome.lock();
        if outcome.result.is_some() {
            return;
        }
        let result = result.map(Arc::new);
        match &result {
            Ok(resource) => {
                self.resource.store(Some(Arc::clone(resource)));
                for slot in outcome.subscribers.drain(..).filter_map(|w| w.upgrade()) {
                    slot.stage_arc(Arc::clone(resource));
                }
                #[cfg(feature = "tracing")]
                tracing::debug!("loader_finished: {}", self.name);
            }
            Err(_error) => {
                outcome.subscribers.clear();
                #[cfg(feature = "tracing")]
                tracing::warn!("loader_failed: {}", _error);
            }
        }
        outcome.result = Some(result);
        self.finished.store(true, Ordering::Release);
        self.ready.notify_all();
    }
}

/// A resource being built on a worker thread.
pub struct AsyncLoader<T> {
    state: Arc<LoadState<T>>,
    key: Option<RegistryKey>,
}

impl<T: Send + Sync + 'static> AsyncLoader<T> {
    /// Start building a resource on a new worker thread named after `name`.
    ///
    /// A closure that panics, or a thread that cannot be spawned, completes
    /// the loader with [`LoadError::WorkerLost`].
    pub fn spawn<F>(name: impl Into<String>, load: F) -> Self
    where
        F: FnOnce() -> Result<T, LoadError> + Send + 'static,
    {
        Self::start(name.into(), None, load)
    }

    /// Process-wide loader for `key`.
    ///
    /// Returns the live loader for this resource type and key if one exists;
    /// otherwise spawns `load` and registers the new loader. The entry is
    /// removed when the last returned handle drops, so a later call starts
    /// a fresh load.
    pub fn shared<F>(key: impl Into<String>, load: F) -> Arc<Self>
    where
        F: FnOnce() -> Result<T, LoadError> + Send + 'static,
    {
        let name = key.into();
        let registry_key = (TypeId::of::<T>(), name.clone());

        let mut registry = SHARED_LOADERS.lock();
        let existing = registry
            .get(&registry_key)
            .and_then(Weak::upgrade)
            .map(|entry| entry.downcast::<Self>());
        let stale = match existing {
            Some(Ok(loader)) => return loader,
            other => other,
        };

        let loader = Arc::new(Self::start(name, Some(registry_key.clone()), load));
        let erased: Arc<dyn Any + Send + Sync> = loader.clone();
        registry.insert(registry_key, Arc::downgrade(&erased));
        drop(registry);
        // Released only after unlocking: its drop takes the registry lock.
        drop(stale);
        loader
    }

    fn start<F>(name: String, key: Option<RegistryKey>, load: F) -> Self
    where
        F: FnOnce() -> Result<T, LoadError> + Send + 'static,
    {
        let state = Arc::new(LoadState {
            name: name.clone(),
            resource: ArcSwapOption::empty(),
            finished: AtomicBool::new(false),
            outcome: Mutex::new(Outcome {
                result: None,
                subscribers: Vec::new(),
            }),
            ready: Condvar::new(),
        });

        #[cfg(feature = "tracing")]
        tracing::debug!("loader_started: {}", name);

        let worker = Arc::clone(&state);
        let spawned = thread::Builder::new()
            .name(format!("cadenza-loader-{name}"))
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(load))
                    .unwrap_or_else(|_| Err(LoadError::WorkerLost(worker.name.clone())));
                worker.complete(result);
            });
        if spawned.is_err() {
            state.complete(Err(LoadError::WorkerLost(name)));
        }
        Self { state, key }
    }

    /// Loader name, or the shared key.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Whether the resource is available.
    pub fn is_loaded(&self) -> bool {
        self.state.resource.load().is_some()
    }

    /// Whether the worker has completed, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }

    /// The resource, once loaded.
    pub fn resource(&self) -> Option<Arc<T>> {
        self.state.resource.load_full()
    }

    /// The failure, if the load failed.
    pub fn error(&self) -> Option<LoadError> {
        match &self.state.outcome.lock().result {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// Block until the worker completes.
    ///
    /// # Errors
    ///
    /// The [`LoadError`] the worker reported.
    pub fn wait(&self) -> Result<Arc<T>, LoadError> {
        let mut outcome = self.state.outcome.lock();
        loop {
            if let Some(result) = &outcome.result {
                return result.clone();
            }
            self.state.ready.wait(&mut outcome);
        }
    }

    /// Block for at most `timeout`. `None` if the worker is still running.
    pub fn wait_for(&self, timeout: Duration) -> Option<Result<Arc<T>, LoadError>> {
        let mut outcome = self.state.outcome.lock();
        if outcome.result.is_none() {
            self.state.ready.wait_for(&mut outcome, timeout);
        }
        outcome.result.clone()
    }

    /// Deliver the resource into `slot` once it is loaded; immediately if
    /// it already is. Nothing is staged if the load fails.
    pub fn subscribe(&self, slot: &Arc<Staged<T>>) {
        let mut outcome = self.state.outcome.lock();
        match &outcome.result {
            Some(Ok(resource)) => slot.stage_arc(Arc::clone(resource)),
            Some(Err(_)) => {}
            None => outcome.subscribers.push(Arc::downgrade(slot)),
        }
    }
}

impl<T> Drop for AsyncLoader<T> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let mut registry = SHARED_LOADERS.lock();
        // Only remove our own entry; a newer loader may have replaced it.
        if registry.get(&key).is_some_and(|w| w.strong_count() == 0) {
            registry.remove(&key);
            #[cfg(feature = "tracing")]
            tracing::debug!("loader_released: {}", key.1);
        }
    }
}

impl<T> core::fmt::Debug for AsyncLoader<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AsyncLoader")
            .field("name", &self.state.name)
            .field("finished", &self.state.finished.load(Ordering::Acquire))
            .field("shared", &self.key.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_publishes_resource() {
        let loader = AsyncLoader::spawn("table", || Ok(vec![1.0_f32, 2.0, 3.0]));
        let table = loader.wait().expect("loaded");
        assert_eq!(table.len(), 3);
        assert!(loader.is_loaded());
        assert!(loader.is_finished());
        assert!(loader.error().is_none());
        assert!(Arc::ptr_eq(&table, &loader.resource().expect("resource")));
    }

    #[test]
    fn failure_is_reported() {
        let loader: AsyncLoader<Vec<f32>> =
            AsyncLoader::spawn("broken", || Err(LoadError::failed("broken", "no such file")));
        let err = loader.wait().unwrap_err();
        assert_eq!(err, LoadError::failed("broken", "no such file"));
        assert_eq!(loader.error(), Some(err));
        assert!(!loader.is_loaded());
    }

    #[test]
    fn panicking_worker_is_reported() {
        let loader: AsyncLoader<u32> = AsyncLoader::spawn("panics", || panic!("boom"));
        assert_eq!(
            loader.wait().unwrap_err(),
            LoadError::WorkerLost("panics".to_string())
        );
    }

    #[test]
    fn subscriber_receives_resource_through_staged_slot() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let loader = AsyncLoader::spawn("gated", move || {
            rx.recv().map_err(|e| LoadError::failed("gated", e.to_string()))?;
            Ok(42_u32)
        });
        let early = Arc::new(Staged::new());
        loader.subscribe(&early);
        assert!(!early.is_pending());
        tx.send(()).expect("worker alive");
        loader.wait().expect("loaded");
        assert_eq!(early.take().as_deref(), Some(&42));

        let late = Arc::new(Staged::new());
        loader.subscribe(&late);
        assert_eq!(late.take().as_deref(), Some(&42));
    }

    #[test]
    fn wait_for_times_out_while_running() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let loader = AsyncLoader::spawn("slow", move || {
            rx.recv().map_err(|e| LoadError::failed("slow", e.to_string()))?;
            Ok(1_u8)
        });
        assert!(loader.wait_for(Duration::from_millis(10)).is_none());
        tx.send(()).expect("worker alive");
        assert_eq!(loader.wait().as_deref().copied(), Ok(1));
    }

    #[test]
    fn shared_loader_is_a_singleton_until_released() {
        struct Database(u32);

        let first = AsyncLoader::shared("unit-test-db", || Ok(Database(1)));
        let second = AsyncLoader::shared("unit-test-db", || Ok(Database(2)));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.wait().map(|db| db.0), Ok(1));

        drop(first);
        drop(second);
        assert!(
            !SHARED_LOADERS
                .lock()
                .contains_key(&(TypeId::of::<Database>(), "unit-test-db".to_string()))
        );

        let third = AsyncLoader::shared("unit-test-db", || Ok(Database(3)));
        assert_eq!(third.wait().map(|db| db.0), Ok(3));
    }

    #[test]
    fn shared_keys_are_per_type() {
        let a = AsyncLoader::shared("unit-test-typed", || Ok(1_u16));
        let b = AsyncLoader::shared("unit-test-typed", || Ok(2_u64));
        assert_eq!(a.wait().as_deref().copied(), Ok(1));
        assert_eq!(b.wait().as_deref().copied(), Ok(2));
    }
}

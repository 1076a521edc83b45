//! Scoped lazy load/unload of one inference artifact, with serialized
//! predictions (spec §4.1).

use std::path::Path;
use std::sync::Mutex;

use log::{debug, warn};
use tch::{CModule, Device, TchError};

use crate::error::{Error, Result};

/// Lifecycle state of a [`ManagedModel`]. A failed load leaves the model
/// `Unloaded`, not poisoned — the very next `perform` call retries (spec
/// §4.1: "non-fatal to subsequent requests").
enum ModelState<M> {
    Unloaded,
    Loaded(M),
}

/// A single lazily-loaded inference backend, loaded on first use and
/// unloadable on demand.
///
/// Generic over the backend type `M` so this module's own tests can swap
/// in a fixture backend that needs no real TorchScript archive on disk;
/// every other component in this crate uses the default `M = CModule` and
/// never names the type parameter. Loading is deferred to a boxed closure
/// rather than storing a `(path, device)` pair directly, which is what
/// lets [`ManagedModel::with_loader`] substitute an arbitrary producer of
/// `M` for tests without touching the production constructor.
///
/// All predictions against one artifact are serialized through an internal
/// `Mutex`: `perform` holds the lock for the full load-if-absent-then-run
/// duration, so concurrent callers queue rather than race a load.
pub struct ManagedModel<M = CModule> {
    name: String,
    loader: Box<dyn Fn() -> std::result::Result<M, TchError> + Send + Sync>,
    state: Mutex<ModelState<M>>,
}

impl ManagedModel<CModule> {
    pub fn new(name: impl Into<String>, path: impl AsRef<Path>, device: Device) -> Self {
        let path = path.as_ref().to_path_buf();
        ManagedModel {
            name: name.into(),
            loader: Box::new(move || CModule::load_on_device(&path, device)),
            state: Mutex::new(ModelState::Unloaded),
        }
    }
}

impl<M> ManagedModel<M> {
    /// Build a `ManagedModel` around an arbitrary backend producer, for
    /// tests that need to observe load/unload/serialization behavior
    /// without a real `tch::CModule` artifact on disk.
    #[cfg(test)]
    fn with_loader(
        name: impl Into<String>,
        loader: impl Fn() -> std::result::Result<M, TchError> + Send + Sync + 'static,
    ) -> Self {
        ManagedModel { name: name.into(), loader: Box::new(loader), state: Mutex::new(ModelState::Unloaded) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` if the underlying artifact is currently resident in memory.
    pub fn is_loaded(&self) -> bool {
        matches!(*self.state.lock().expect("ManagedModel mutex poisoned"), ModelState::Loaded(_))
    }

    /// Load the artifact if not already loaded. Idempotent.
    pub fn load(&self) -> Result<()> {
        let mut guard = self.state.lock().expect("ManagedModel mutex poisoned");
        if matches!(*guard, ModelState::Loaded(_)) {
            return Ok(());
        }
        debug!("loading model {}", self.name);
        let module = (self.loader)().map_err(|source| Error::LoadFailed { name: self.name.clone(), source })?;
        *guard = ModelState::Loaded(module);
        Ok(())
    }

    /// Release the artifact. A no-op if already unloaded.
    pub fn unload(&self) {
        let mut guard = self.state.lock().expect("ManagedModel mutex poisoned");
        if matches!(*guard, ModelState::Loaded(_)) {
            debug!("unloading model {}", self.name);
        }
        *guard = ModelState::Unloaded;
    }

    /// Run `f` against the loaded model, loading it first if necessary.
    /// A failed load or a failing `f` leaves the model `Unloaded` again.
    pub fn perform<T>(&self, f: impl FnOnce(&M) -> Result<T>) -> Result<T> {
        self.load()?;
        let guard = self.state.lock().expect("ManagedModel mutex poisoned");
        let module = match &*guard {
            ModelState::Loaded(module) => module,
            ModelState::Unloaded => unreachable!("load() above guarantees Loaded"),
        };
        let result = f(module);
        if let Err(err) = &result {
            warn!("inference failed in {}: {err}", self.name);
        }
        result
    }

    /// Load then immediately unload, to populate on-disk compilation
    /// caches the backend may maintain (spec §4.1).
    pub fn prewarm(&self) -> Result<()> {
        self.load()?;
        self.unload();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A fixture backend standing in for `tch::CModule` in tests that
    /// only care about `ManagedModel`'s own load/unload/serialization
    /// bookkeeping, not real tensor inference.
    struct FakeBackend {
        invocations: AtomicUsize,
    }

    /// The one TchError these tests ever produce comes from a real failing
    /// `tch` call (a load against a path that cannot exist) rather than a
    /// hand-built variant, since `TchError` exposes no public constructor.
    fn real_load_error() -> TchError {
        CModule::load_on_device("/nonexistent/path.pt", Device::Cpu).unwrap_err()
    }

    #[test]
    fn starts_unloaded() {
        let model = ManagedModel::new("missing", "/nonexistent/path.pt", Device::Cpu);
        assert!(!model.is_loaded());
    }

    #[test]
    fn failed_load_leaves_state_unloaded_and_retries() {
        let model = ManagedModel::new("missing", "/nonexistent/path.pt", Device::Cpu);
        assert!(model.load().is_err());
        assert!(!model.is_loaded());
        // Retrying is allowed: still fails (path still missing) but does
        // not panic or get stuck in a poisoned state.
        assert!(model.load().is_err());
    }

    #[test]
    fn unload_before_load_is_a_no_op() {
        let model = ManagedModel::new("missing", "/nonexistent/path.pt", Device::Cpu);
        model.unload();
        assert!(!model.is_loaded());
    }

    #[test]
    fn perform_loads_once_and_reuses_the_cached_backend() {
        let load_count = Arc::new(AtomicUsize::new(0));
        let counted = load_count.clone();
        let model: ManagedModel<FakeBackend> = ManagedModel::with_loader("fake", move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(FakeBackend { invocations: AtomicUsize::new(0) })
        });

        for _ in 0..3 {
            model.perform(|backend| {
                backend.invocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }).unwrap();
        }

        assert_eq!(load_count.load(Ordering::SeqCst), 1, "perform must load once, not once per call");
        assert!(model.is_loaded());
    }

    #[test]
    fn unload_forces_the_next_perform_to_reload() {
        let load_count = Arc::new(AtomicUsize::new(0));
        let counted = load_count.clone();
        let model: ManagedModel<FakeBackend> = ManagedModel::with_loader("fake", move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(FakeBackend { invocations: AtomicUsize::new(0) })
        });

        model.perform(|_| Ok(())).unwrap();
        model.unload();
        assert!(!model.is_loaded());
        model.perform(|_| Ok(())).unwrap();

        assert_eq!(load_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn custom_loader_failure_is_retryable_like_the_path_based_constructor() {
        let model: ManagedModel<FakeBackend> = ManagedModel::with_loader("fake", || Err(real_load_error()));
        assert!(model.load().is_err());
        assert!(!model.is_loaded());
        assert!(model.load().is_err());
    }
}

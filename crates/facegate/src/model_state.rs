//! Process-wide, lazily loaded pool of face model sets.
//!
//! The first caller of [`ModelState::ensure_ready`] loads the weights on a
//! blocking thread; callers arriving while that load is in flight wait for it
//! instead of starting their own. A failed load leaves the state unloaded, so
//! a later call retries.
//!
//! ONNX sessions need exclusive access to run, so the pool holds one model set
//! per extraction that may run at once. A [`Lease`] hands a set out and returns
//! it on drop.

use facegate_core::{FaceModels, ModelLoadError, ModelPaths};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

/// Something that can produce one set of loaded face models.
pub trait ModelLoader: Send + Sync + 'static {
    type Models: Send + 'static;

    /// Blocking load. Runs on the blocking thread pool.
    fn load(&self) -> Result<Self::Models, ModelLoadError>;
}

/// Loads the ONNX detector, landmark and encoder weights from disk.
#[derive(Debug, Clone)]
pub struct OnnxModelLoader {
    pub paths: ModelPaths,
    pub intra_threads: usize,
}

impl ModelLoader for OnnxModelLoader {
    type Models = FaceModels;

    fn load(&self) -> Result<FaceModels, ModelLoadError> {
        FaceModels::load(&self.paths, self.intra_threads)
    }
}

/// Idle model sets. Callers bound checkouts to [`ModelPool::size`] so one is
/// always free for a caller allowed to run.
#[derive(Debug)]
pub struct ModelPool<M> {
    idle: Mutex<Vec<M>>,
    size: usize,
}

impl<M> ModelPool<M> {
    fn new(sets: Vec<M>) -> Self {
        let size = sets.len();
        Self { idle: Mutex::new(sets), size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Take an idle set, if one is free.
    pub fn checkout(self: &Arc<Self>) -> Option<Lease<M>> {
        let models = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop()?;
        Some(Lease {
            pool: Arc::clone(self),
            models: Some(models),
        })
    }
}

/// Exclusive use of one model set; returned to the pool on drop.
pub struct Lease<M> {
    pool: Arc<ModelPool<M>>,
    models: Option<M>,
}

impl<M> Deref for Lease<M> {
    type Target = M;

    fn deref(&self) -> &M {
        // Only emptied in drop.
        self.models.as_ref().unwrap_or_else(|| unreachable!("lease used after drop"))
    }
}

impl<M> DerefMut for Lease<M> {
    fn deref_mut(&mut self) -> &mut M {
        self.models.as_mut().unwrap_or_else(|| unreachable!("lease used after drop"))
    }
}

impl<M> Drop for Lease<M> {
    fn drop(&mut self) {
        if let Some(models) = self.models.take() {
            self.pool
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(models);
        }
    }
}

pub struct ModelState<L: ModelLoader> {
    loader: Arc<L>,
    pool_size: usize,
    cell: OnceCell<Arc<ModelPool<L::Models>>>,
    attempts: AtomicUsize,
}

impl<L: ModelLoader> ModelState<L> {
    /// `pool_size` model sets are loaded together on first use.
    pub fn new(loader: L, pool_size: usize) -> Self {
        Self {
            loader: Arc::new(loader),
            pool_size: pool_size.max(1),
            cell: OnceCell::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Return the loaded pool, loading it first if needed.
    pub async fn ensure_ready(&self) -> Result<Arc<ModelPool<L::Models>>, ModelLoadError> {
        let pool = self
            .cell
            .get_or_try_init(|| async {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let sets = self.pool_size;
                tracing::info!(attempt, sets, "loading face models");

                let loader = Arc::clone(&self.loader);
                let loaded = tokio::task::spawn_blocking(move || {
                    (0..sets).map(|_| loader.load()).collect::<Result<Vec<_>, _>>()
                })
                .await
                .map_err(|e| ModelLoadError::Aborted(e.to_string()))?;

                match loaded {
                    Ok(sets) => {
                        tracing::info!(attempt, sets = sets.len(), "face models loaded");
                        Ok(Arc::new(ModelPool::new(sets)))
                    }
                    Err(err) => {
                        tracing::error!(attempt, error = %err, "face model load failed; will retry on next call");
                        Err(err)
                    }
                }
            })
            .await?;
        Ok(Arc::clone(pool))
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// Number of load attempts started so far.
    pub fn load_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct CountingLoader {
        calls: Arc<AtomicUsize>,
        available: Arc<AtomicBool>,
        delay: Duration,
    }

    impl ModelLoader for CountingLoader {
        type Models = usize;

        fn load(&self) -> Result<usize, ModelLoadError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.available.load(Ordering::SeqCst) {
                Ok(n)
            } else {
                Err(ModelLoadError::MissingFile("weights/det.onnx".into()))
            }
        }
    }

    fn state(
        available: bool,
        delay_ms: u64,
        pool_size: usize,
    ) -> (Arc<ModelState<CountingLoader>>, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let flag = Arc::new(AtomicBool::new(available));
        let loader = CountingLoader {
            calls: Arc::clone(&calls),
            available: Arc::clone(&flag),
            delay: Duration::from_millis(delay_ms),
        };
        (Arc::new(ModelState::new(loader, pool_size)), calls, flag)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_load() {
        let (state, calls, _) = state(true, 100, 1);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let state = Arc::clone(&state);
                tokio::spawn(async move { state.ensure_ready().await.map(|pool| pool.size()) })
            })
            .collect();

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.load_attempts(), 1);
        assert!(state.is_loaded());
    }

    #[tokio::test]
    async fn test_failed_load_is_retryable() {
        let (state, calls, flag) = state(false, 0, 1);

        let err = state.ensure_ready().await.unwrap_err();
        assert!(matches!(err, ModelLoadError::MissingFile(_)));
        assert!(!state.is_loaded());

        flag.store(true, Ordering::SeqCst);
        let pool = state.ensure_ready().await.unwrap();
        assert_eq!(*pool.checkout().unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Loaded state is never dropped.
        state.ensure_ready().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pool_loads_every_set_and_leases_return() {
        let (state, calls, _) = state(true, 0, 3);
        let pool = state.ensure_ready().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pool.size(), 3);

        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        let c = pool.checkout().unwrap();
        assert!(pool.checkout().is_none());
        let mut taken = vec![*a, *b, *c];
        taken.sort();
        assert_eq!(taken, vec![0, 1, 2]);

        drop(b);
        assert_eq!(pool.idle(), 1);
        assert!(pool.checkout().is_some());
        drop((a, c));
        assert_eq!(pool.idle(), 3);
    }
}

use log::info;
use ndarray::Array2;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::bootstrap::fit_bootstrap_model;
use crate::config::{BootstrapConfig, DetectorConfig, ForestConfig};
use crate::model_inference::{Provenance, VoiceModel};
use crate::model_store::ModelStore;
use crate::{Classification, DetectionError, Result};

/// Owns the current [`VoiceModel`] and its lifecycle.
///
/// Readers take a cheap `Arc` snapshot; a replacement swaps the pointer, so
/// in-flight predictions keep using the model they started with. Bootstrap
/// and replacement are serialised by a single writer lock, which also makes
/// bootstrap run at most once per registry.
pub struct ModelRegistry {
    current: RwLock<Option<Arc<VoiceModel>>>,
    writer: Mutex<()>,
    store: Option<ModelStore>,
    forest: ForestConfig,
    bootstrap: BootstrapConfig,
    bootstrap_runs: AtomicUsize,
}

impl ModelRegistry {
    pub fn new(store: Option<ModelStore>, forest: ForestConfig, bootstrap: BootstrapConfig) -> Self {
        Self {
            current: RwLock::new(None),
            writer: Mutex::new(()),
            store,
            forest,
            bootstrap,
            bootstrap_runs: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(
            config.model_dir.as_ref().map(ModelStore::new),
            config.forest.clone(),
            config.bootstrap.clone(),
        )
    }

    /// In-memory registry preloaded with `model`; nothing is persisted.
    pub fn with_model(model: VoiceModel) -> Self {
        let registry = Self::new(None, ForestConfig::default(), BootstrapConfig::default());
        if let Ok(mut current) = registry.current.write() {
            *current = Some(Arc::new(model));
        }
        registry
    }

    pub fn store(&self) -> Option<&ModelStore> {
        self.store.as_ref()
    }

    /// How many times this registry has fitted a bootstrap model.
    pub fn bootstrap_runs(&self) -> usize {
        self.bootstrap_runs.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.current
            .read()
            .map(|current| current.is_some())
            .unwrap_or(false)
    }

    /// Snapshot of the current model without any initialisation.
    pub fn current(&self) -> Result<Arc<VoiceModel>> {
        let current = self
            .current
            .read()
            .map_err(|_| DetectionError::LockPoisoned("model registry"))?;
        current
            .clone()
            .ok_or_else(|| DetectionError::ModelNotReady("no model has been loaded".to_string()))
    }

    /// Makes a model available: loads the persisted one if present, otherwise
    /// fits and persists a bootstrap model. Idempotent; concurrent callers
    /// wait for the first one and then share its result.
    pub fn ensure_ready(&self) -> Result<Arc<VoiceModel>> {
        if let Ok(model) = self.current() {
            return Ok(model);
        }

        let _guard = self
            .writer
            .lock()
            .map_err(|_| DetectionError::LockPoisoned("model registry writer"))?;

        // Another caller may have finished while we waited.
        if let Ok(model) = self.current() {
            return Ok(model);
        }

        if let Some(store) = &self.store {
            if let Some(model) = store.load()? {
                return self.publish(model);
            }
        }

        let model = fit_bootstrap_model(&self.bootstrap, &self.forest)?;
        self.bootstrap_runs.fetch_add(1, Ordering::SeqCst);
        if let Some(store) = &self.store {
            store.save(&model)?;
        }
        self.publish(model)
    }

    /// Persists `model` and then makes it current.
    pub fn replace(&self, model: VoiceModel) -> Result<Arc<VoiceModel>> {
        model.validate()?;
        let _guard = self
            .writer
            .lock()
            .map_err(|_| DetectionError::LockPoisoned("model registry writer"))?;

        if let Some(store) = &self.store {
            store.save(&model)?;
        }
        self.publish(model)
    }

    /// Fits a model on real labelled features and replaces the current one.
    pub fn retrain(&self, features: &Array2<f64>, labels: &[Classification]) -> Result<Arc<VoiceModel>> {
        let model = VoiceModel::fit(features, labels, Provenance::LabeledData, &self.forest)?;
        self.replace(model)
    }

    fn publish(&self, model: VoiceModel) -> Result<Arc<VoiceModel>> {
        let model = Arc::new(model);
        let mut current = self
            .current
            .write()
            .map_err(|_| DetectionError::LockPoisoned("model registry"))?;
        *current = Some(Arc::clone(&model));

        info!(
            "Published {} model trained on {} samples",
            model.provenance().as_str(),
            model.training_samples()
        );
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::synthesize_training_set;
    use std::thread;
    use tempfile::TempDir;

    fn fast_forest() -> ForestConfig {
        ForestConfig {
            n_trees: 10,
            ..ForestConfig::default()
        }
    }

    #[test]
    fn starts_not_ready() {
        let registry = ModelRegistry::new(None, fast_forest(), BootstrapConfig::default());
        assert!(!registry.is_ready());
        assert!(matches!(registry.current(), Err(DetectionError::ModelNotReady(_))));
    }

    #[test]
    fn ensure_ready_is_idempotent() {
        let registry = ModelRegistry::new(None, fast_forest(), BootstrapConfig::default());
        let first = registry.ensure_ready().unwrap();
        let second = registry.ensure_ready().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.bootstrap_runs(), 1);
        assert_eq!(first.provenance(), Provenance::SyntheticBootstrap);
    }

    #[test]
    fn concurrent_ensure_ready_bootstraps_once() {
        let registry = Arc::new(ModelRegistry::new(None, fast_forest(), BootstrapConfig::default()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.ensure_ready().map(|_| ()))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(registry.bootstrap_runs(), 1);
    }

    #[test]
    fn persisted_model_is_reused_by_a_new_registry() {
        let dir = TempDir::new().unwrap();
        let first = ModelRegistry::new(Some(ModelStore::new(dir.path())), fast_forest(), BootstrapConfig::default());
        let model = first.ensure_ready().unwrap();
        assert_eq!(first.bootstrap_runs(), 1);

        let second = ModelRegistry::new(Some(ModelStore::new(dir.path())), fast_forest(), BootstrapConfig::default());
        let loaded = second.ensure_ready().unwrap();
        assert_eq!(second.bootstrap_runs(), 0);
        assert_eq!(*loaded, *model);
    }

    #[test]
    fn retrain_replaces_bootstrap_model() {
        let dir = TempDir::new().unwrap();
        let registry = ModelRegistry::new(Some(ModelStore::new(dir.path())), fast_forest(), BootstrapConfig::default());
        let bootstrapped = registry.ensure_ready().unwrap();

        let (x, y) = synthesize_training_set(&BootstrapConfig { n_samples: 40, seed: 9 }).unwrap();
        registry.retrain(&x, &y).unwrap();

        let current = registry.current().unwrap();
        assert_eq!(current.provenance(), Provenance::LabeledData);
        // Old snapshot is untouched.
        assert_eq!(bootstrapped.provenance(), Provenance::SyntheticBootstrap);

        let reloaded = ModelStore::new(dir.path()).load().unwrap().unwrap();
        assert_eq!(reloaded.provenance(), Provenance::LabeledData);
        // A ready registry never bootstraps again.
        registry.ensure_ready().unwrap();
        assert_eq!(registry.bootstrap_runs(), 1);
    }

    #[test]
    fn broken_store_surfaces_error_instead_of_bootstrapping() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::new(dir.path());
        std::fs::write(store.model_path(), b"garbage").unwrap();

        let registry = ModelRegistry::new(Some(store), fast_forest(), BootstrapConfig::default());
        assert!(matches!(registry.ensure_ready(), Err(DetectionError::Storage(_))));
        assert_eq!(registry.bootstrap_runs(), 0);
    }
}

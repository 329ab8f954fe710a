//! Two-phase model registry.
//!
//! Models can be registered before the application is configured. Until
//! then they are bound to the placeholder manager; [`ModelRegistry::rebind_all`]
//! moves every registered model to the live manager during setup. The
//! handles returned by [`ModelRegistry::register`] stay the same objects
//! across rebinding: only their manager reference changes.
//!
//! Rebinding is a setup-phase operation and is not meant to race with
//! request traffic.

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::manager::Manager;
use keel_types::ModelDef;

/// A model definition bound to a manager.
pub struct RegisteredModel {
    def: ModelDef,
    manager: RwLock<Arc<Manager>>,
}

/// Shared handle to a registered model.
pub type Model = Arc<RegisteredModel>;

impl RegisteredModel {
    pub fn def(&self) -> &ModelDef {
        &self.def
    }

    pub fn table(&self) -> &str {
        &self.def.table
    }

    /// The manager this model is currently bound to.
    pub fn manager(&self) -> Arc<Manager> {
        Arc::clone(&*self.manager.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Binds the model to `manager`. Returns `false` if it already was.
    fn bind(&self, manager: &Arc<Manager>) -> bool {
        let mut current = self.manager.write().unwrap_or_else(|e| e.into_inner());
        if Arc::ptr_eq(&*current, manager) {
            return false;
        }
        *current = Arc::clone(manager);
        true
    }
}

impl fmt::Debug for RegisteredModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredModel")
            .field("table", &self.def.table)
            .field("manager", &self.manager().url())
            .finish()
    }
}

/// Registry of models and the manager new registrations bind to.
pub struct ModelRegistry {
    current: RwLock<Arc<Manager>>,
    models: RwLock<Vec<Model>>,
}

impl ModelRegistry {
    /// Creates an empty registry bound to a fresh placeholder manager.
    pub fn new() -> Self {
        Self::with_manager(Manager::placeholder())
    }

    /// Creates an empty registry bound to `manager`.
    pub fn with_manager(manager: Arc<Manager>) -> Self {
        Self {
            current: RwLock::new(manager),
            models: RwLock::new(Vec::new()),
        }
    }

    /// The manager new registrations bind to.
    pub fn manager(&self) -> Arc<Manager> {
        Arc::clone(&*self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Registers `def` with the current manager and returns its handle.
    ///
    /// Registering a table name again returns the existing handle, rebound to
    /// the current manager; the original definition is kept.
    pub fn register(&self, def: ModelDef) -> Model {
        let manager = self.manager();
        let mut models = self.models.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = models.iter().find(|m| m.table() == def.table) {
            if existing.def != def {
                tracing::warn!(
                    table = %def.table,
                    "model re-registered with a different definition, keeping the original"
                );
            }
            existing.bind(&manager);
            return Arc::clone(existing);
        }

        tracing::debug!(table = %def.table, manager = %manager.url(), "model registered");
        let model = Arc::new(RegisteredModel {
            def,
            manager: RwLock::new(manager),
        });
        models.push(Arc::clone(&model));
        model
    }

    /// Binds every registered model, and all future registrations, to
    /// `manager`. Returns the number of models whose binding changed.
    pub fn rebind_all(&self, manager: Arc<Manager>) -> usize {
        let models = self.models();
        let changed = models.iter().filter(|m| m.bind(&manager)).count();

        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = manager;

        tracing::info!(
            models = models.len(),
            rebound = changed,
            manager = %current.url(),
            "models bound to manager"
        );
        changed
    }

    /// Registered models in registration order.
    pub fn models(&self) -> Vec<Model> {
        self.models.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Looks up a registered model by table name.
    pub fn get(&self, table: &str) -> Option<Model> {
        self.models().into_iter().find(|m| m.table() == table)
    }

    pub fn len(&self) -> usize {
        self.models().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables: Vec<String> = self.models().iter().map(|m| m.table().to_string()).collect();
        f.debug_struct("ModelRegistry")
            .field("manager", &self.manager().url())
            .field("models", &tables)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnectionParams;
    use keel_types::Field;

    fn live_manager() -> Arc<Manager> {
        Manager::new("sqlite:///:memory:", ConnectionParams::default()).expect("manager")
    }

    #[test]
    fn registration_before_setup_uses_placeholder() {
        let registry = ModelRegistry::new();
        let model = registry.register(ModelDef::new("test_model").field(Field::char("data")));

        assert!(model.manager().is_placeholder());
        assert!(!model.manager().is_connected());
        assert_eq!(model.manager().database(), None);
    }

    #[test]
    fn rebind_preserves_identity() {
        let registry = ModelRegistry::new();
        let model = registry.register(ModelDef::new("test_model").field(Field::char("data")));
        let placeholder = model.manager();

        let live = live_manager();
        assert_eq!(registry.rebind_all(Arc::clone(&live)), 1);

        let again = registry.get("test_model").expect("still registered");
        assert!(Arc::ptr_eq(&model, &again));
        assert!(!Arc::ptr_eq(&model.manager(), &placeholder));
        assert!(Arc::ptr_eq(&model.manager(), &live));
        assert_eq!(model.manager().database().as_deref(), Some(":memory:"));
    }

    #[test]
    fn rebind_twice_is_noop() {
        let registry = ModelRegistry::new();
        let a = registry.register(ModelDef::new("a"));
        let b = registry.register(ModelDef::new("b"));

        let live = live_manager();
        assert_eq!(registry.rebind_all(Arc::clone(&live)), 2);
        assert_eq!(registry.rebind_all(Arc::clone(&live)), 0);

        assert!(Arc::ptr_eq(&a.manager(), &live));
        assert!(Arc::ptr_eq(&b.manager(), &live));
    }

    #[test]
    fn registration_after_rebind_uses_live_manager() {
        let registry = ModelRegistry::new();
        let live = live_manager();
        registry.rebind_all(Arc::clone(&live));

        let model = registry.register(ModelDef::new("late"));
        assert!(Arc::ptr_eq(&model.manager(), &live));
    }

    #[test]
    fn reregistration_returns_existing_handle() {
        let registry = ModelRegistry::new();
        let first = registry.register(ModelDef::new("items").field(Field::char("content")));
        let second = registry.register(ModelDef::new("items").field(Field::text("other")));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(first.def().get_field("content").is_some());
    }

    #[test]
    fn models_keep_registration_order() {
        let registry = ModelRegistry::new();
        for table in ["c", "a", "b"] {
            registry.register(ModelDef::new(table));
        }
        let tables: Vec<String> = registry
            .models()
            .iter()
            .map(|m| m.table().to_string())
            .collect();
        assert_eq!(tables, vec!["c", "a", "b"]);
    }

    #[test]
    fn registry_survives_poisoned_lock() {
        let registry = Arc::new(ModelRegistry::new());
        registry.register(ModelDef::new("first"));

        let poisoner = Arc::clone(&registry);
        let joined = std::thread::spawn(move || {
            let _guard = poisoner.models.write().unwrap();
            panic!("poison the model list");
        })
        .join();
        assert!(joined.is_err());
        assert!(registry.models.is_poisoned());

        registry.register(ModelDef::new("second"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.rebind_all(live_manager()), 2);
    }
}

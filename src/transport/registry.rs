//! Registry of transport handler kinds.
//!
//! Append-only table of `(name, factory)` rows plus a `server type -> names`
//! index. Registration happens once per handler kind at startup; after that
//! the table is only read, once per dispatcher construction.
//!
//! A process-wide instance is available through [`TransportRegistry::global`].
//! Dispatchers use it unless another registry is injected with
//! [`DispatcherBuilder::transports`](crate::DispatcherBuilder::transports).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;

use super::{Binder, TransportHandler};
use crate::dispatcher::WeakDispatcher;

/// Builds one binder for one dispatcher.
pub type BinderFactory = Arc<dyn Fn(WeakDispatcher) -> Arc<dyn Binder> + Send + Sync>;

static GLOBAL: LazyLock<TransportRegistry> = LazyLock::new(TransportRegistry::new);

#[derive(Clone, Default)]
struct TransportTable {
    /// Handler factories in registration order.
    handlers: Vec<(String, BinderFactory)>,
    /// Handler names by server type.
    server_types: HashMap<TypeId, Vec<String>>,
}

/// Binders and server index owned by one dispatcher.
pub(crate) struct TransportSnapshot {
    pub(crate) binders: HashMap<String, Arc<dyn Binder>>,
    pub(crate) server_types: HashMap<TypeId, Vec<String>>,
}

/// Table of transport handler kinds.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    table: Arc<RwLock<TransportTable>>,
}

impl TransportRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static TransportRegistry {
        &GLOBAL
    }

    /// Register handler type `H` under `name` for servers of type `S`.
    pub fn register<H, S>(&self, name: &str)
    where
        H: TransportHandler,
        S: Any,
    {
        self.register_with::<S, _>(name, |dispatcher| -> Arc<dyn Binder> {
            Arc::new(H::new(dispatcher))
        });
    }

    /// Register a binder factory under `name` for servers of type `S`.
    ///
    /// Registering an existing name replaces its factory in place and adds
    /// `S` to the server types it binds to.
    pub fn register_with<S, F>(&self, name: &str, factory: F)
    where
        S: Any,
        F: Fn(WeakDispatcher) -> Arc<dyn Binder> + Send + Sync + 'static,
    {
        let factory: BinderFactory = Arc::new(factory);
        let mut table = self.table.write();

        match table.handlers.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = factory,
            None => table.handlers.push((name.to_string(), factory)),
        }

        let names = table.server_types.entry(TypeId::of::<S>()).or_default();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }

        tracing::trace!(
            "Registered transport handler {} for {}",
            name,
            std::any::type_name::<S>()
        );
    }

    /// Registered handler names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.table
            .read()
            .handlers
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Handler names registered for server type `S`.
    pub fn names_for<S: Any>(&self) -> Vec<String> {
        self.table
            .read()
            .server_types
            .get(&TypeId::of::<S>())
            .cloned()
            .unwrap_or_default()
    }

    /// Build one binder per registered handler for a new dispatcher.
    ///
    /// The table is copied first so factories run without the lock held.
    pub(crate) fn instantiate(&self, dispatcher: &WeakDispatcher) -> TransportSnapshot {
        let table = self.table.read().clone();

        let binders = table
            .handlers
            .into_iter()
            .map(|(name, factory)| {
                let binder = factory(dispatcher.clone());
                (name, binder)
            })
            .collect();

        TransportSnapshot {
            binders,
            server_types: table.server_types,
        }
    }
}

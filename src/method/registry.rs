//! Method registry for resolving calls by name and argument count.
//!
//! Methods are keyed by `(fullname, arity)`. Lookup tries, in order:
//!
//! 1. an exact `(fullname, arg_count)` match,
//! 2. a variadic entry registered under `fullname`,
//! 3. the missing-method handler, if one is registered.
//!
//! # Concurrency
//!
//! Writes happen at setup time, reads on every request. The table lives
//! behind an [`ArcSwap`]: readers load the current snapshot without locking,
//! writers clone the table, modify the copy and publish it with `rcu`.
//!
//! # Example
//!
//! ```ignore
//! use procwire_server::method::{ArityFilter, MethodRegistry};
//!
//! let registry = MethodRegistry::new();
//! registry.add_sync_fn("sum", |a: i64, b: i64, c: i64| Ok::<_, RpcError>(a + b + c))?;
//!
//! let method = registry.get("sum", 3)?;
//! registry.remove("sum", ArityFilter::All);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::Value;

use super::{into_outcome, to_value, Arity, Handler, Method, SyncHandler};
use crate::error::{ProcwireError, Result, RpcError};
use crate::handler::RequestContext;

/// Names starting with this prefix are reserved for builtin methods.
pub const RESERVED_PREFIX: &str = "$";

/// Builtin method listing every registered fullname.
pub const INTROSPECTION_METHOD: &str = "$methods";

/// Which arities [`MethodRegistry::remove`] should drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArityFilter {
    /// Every arity registered under the name.
    All,
    /// Only this arity.
    Only(Arity),
}

/// A type exposing methods bound to an instance.
///
/// The returned methods capture `self` and are registered with
/// [`MethodRegistry::add_instance_methods`].
pub trait InstanceMethods: Send + Sync + 'static {
    /// Methods with their short (un-namespaced) names.
    fn methods(self: Arc<Self>) -> Vec<Method>;
}

/// A type exposing associated functions as methods.
pub trait StaticMethods {
    /// Methods with their short (un-namespaced) names.
    fn static_methods() -> Vec<Method>;
}

/// Immutable snapshot of the registered methods.
#[derive(Clone, Default)]
struct MethodTable {
    /// Methods by fullname, then by arity.
    methods: HashMap<String, HashMap<Arity, Arc<Method>>>,
    /// Active missing-method handler.
    missing: Option<Arc<Method>>,
}

impl MethodTable {
    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Registry mapping `(fullname, arity)` to methods.
pub struct MethodRegistry {
    table: Arc<ArcSwap<MethodTable>>,
}

impl MethodRegistry {
    /// Create a registry holding only the builtin introspection method.
    pub fn new() -> Self {
        let registry = Self {
            table: Arc::new(ArcSwap::from_pointee(MethodTable::default())),
        };
        registry.install_introspection();
        registry
    }

    fn install_introspection(&self) {
        // The table holds this method, so the method must not own the table.
        let table = Arc::downgrade(&self.table);
        let method = Method::new(
            INTROSPECTION_METHOD,
            Arity::Fixed(0),
            move |_args, _ctx| {
                let names = table
                    .upgrade()
                    .map(|table| table.load().names())
                    .unwrap_or_default();
                async move { to_value(names) }
            },
        );
        self.publish(Arc::new(method));
    }

    fn publish(&self, method: Arc<Method>) {
        tracing::trace!(
            "Registering method {}/{}",
            method.fullname(),
            method.arity()
        );
        self.table.rcu(|current| {
            let mut next = MethodTable::clone(current);
            next.methods
                .entry(method.fullname().to_string())
                .or_default()
                .insert(method.arity(), Arc::clone(&method));
            next
        });
    }

    /// Register a method.
    ///
    /// Replaces any method already registered under the same
    /// `(fullname, arity)`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcwireError::ReservedName`] for names in the `$` namespace.
    pub fn add(&self, method: Method) -> Result<()> {
        if method.fullname().starts_with(RESERVED_PREFIX) {
            return Err(ProcwireError::ReservedName(method.fullname().to_string()));
        }
        if method.is_missing() {
            self.set_missing(method);
            return Ok(());
        }
        self.publish(Arc::new(method));
        Ok(())
    }

    /// Register an async closure. Arity is its parameter count.
    pub fn add_fn<H, Args>(&self, fullname: &str, handler: H) -> Result<()>
    where
        H: Handler<Args>,
        Args: 'static,
    {
        self.add(Method::from_fn(fullname, handler))
    }

    /// Register a synchronous closure. Arity is its parameter count.
    pub fn add_sync_fn<H, Args>(&self, fullname: &str, handler: H) -> Result<()>
    where
        H: SyncHandler<Args>,
        Args: 'static,
    {
        self.add(Method::from_sync_fn(fullname, handler))
    }

    /// Register a batch of methods under a namespace.
    ///
    /// Each method is stored as `"{namespace}.{name}"`, or under its bare
    /// name when `namespace` is empty.
    pub fn add_methods(
        &self,
        methods: impl IntoIterator<Item = Method>,
        namespace: &str,
    ) -> Result<()> {
        for method in methods {
            let fullname = qualify(namespace, method.fullname());
            self.add(method.renamed(fullname))?;
        }
        Ok(())
    }

    /// Register the methods of an instance under a namespace.
    pub fn add_instance_methods<T: InstanceMethods>(
        &self,
        target: Arc<T>,
        namespace: &str,
    ) -> Result<()> {
        self.add_methods(target.methods(), namespace)
    }

    /// Register the associated-function methods of a type under a namespace.
    pub fn add_static_methods<T: StaticMethods>(&self, namespace: &str) -> Result<()> {
        self.add_methods(T::static_methods(), namespace)
    }

    /// Remove methods registered under `fullname`.
    ///
    /// Returns the number of entries removed. The builtin introspection
    /// method cannot be removed.
    pub fn remove(&self, fullname: &str, arity: ArityFilter) -> usize {
        if fullname == INTROSPECTION_METHOD {
            tracing::warn!("Refusing to remove builtin method {}", fullname);
            return 0;
        }

        let mut removed = 0;
        self.table.rcu(|current| {
            let mut next = MethodTable::clone(current);
            removed = match arity {
                ArityFilter::All => next
                    .methods
                    .remove(fullname)
                    .map(|by_arity| by_arity.len())
                    .unwrap_or(0),
                ArityFilter::Only(arity) => {
                    let mut count = 0;
                    if let Some(by_arity) = next.methods.get_mut(fullname) {
                        count = usize::from(by_arity.remove(&arity).is_some());
                        if by_arity.is_empty() {
                            next.methods.remove(fullname);
                        }
                    }
                    count
                }
            };
            next
        });
        removed
    }

    /// Resolve a call.
    ///
    /// # Errors
    ///
    /// Returns [`ProcwireError::MethodNotFound`] when nothing matches and no
    /// missing-method handler is registered.
    pub fn get(&self, fullname: &str, param_count: usize) -> Result<Arc<Method>> {
        let table = self.table.load();

        let found = table.methods.get(fullname).and_then(|by_arity| {
            by_arity
                .get(&Arity::Fixed(param_count))
                .or_else(|| by_arity.get(&Arity::Variadic))
        });

        found
            .or(table.missing.as_ref())
            .cloned()
            .ok_or_else(|| ProcwireError::MethodNotFound {
                name: fullname.to_string(),
                arity: param_count,
            })
    }

    /// Check whether a method is registered (ignoring the missing handler).
    pub fn contains(&self, fullname: &str, arity: Arity) -> bool {
        self.table
            .load()
            .methods
            .get(fullname)
            .is_some_and(|by_arity| by_arity.contains_key(&arity))
    }

    /// All registered fullnames (sorted), builtins included.
    pub fn names(&self) -> Vec<String> {
        self.table.load().names()
    }

    /// The active missing-method handler.
    pub fn missing_method(&self) -> Option<Arc<Method>> {
        self.table.load().missing.clone()
    }

    fn set_missing(&self, method: Method) {
        let method = Arc::new(method);
        tracing::trace!("Registering missing-method handler");
        self.table.rcu(|current| {
            let mut next = MethodTable::clone(current);
            next.missing = Some(Arc::clone(&method));
            next
        });
    }

    /// Register an async missing-method handler.
    ///
    /// It receives the requested fullname and the raw arguments. Replaces any
    /// previous handler.
    pub fn add_missing_method<F, Fut, R, E>(&self, f: F)
    where
        F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize,
        E: Into<RpcError>,
    {
        self.set_missing(Method::missing(move |name, args, _ctx| {
            let fut = f(name, args);
            async move { into_outcome(fut.await) }
        }));
    }

    /// Register an async missing-method handler that also gets the context.
    pub fn add_missing_method_with_context<F, Fut, R, E>(&self, f: F)
    where
        F: Fn(String, Vec<Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize,
        E: Into<RpcError>,
    {
        self.set_missing(Method::missing(move |name, args, ctx| {
            let fut = f(name, args, ctx);
            async move { into_outcome(fut.await) }
        }));
    }

    /// Register a synchronous missing-method handler.
    pub fn add_sync_missing_method<F, R, E>(&self, f: F)
    where
        F: Fn(String, Vec<Value>) -> std::result::Result<R, E> + Send + Sync + 'static,
        R: Serialize,
        E: Into<RpcError>,
    {
        self.set_missing(Method::missing(move |name, args, _ctx| {
            futures::future::ready(into_outcome(f(name, args)))
        }));
    }

    /// Register a synchronous missing-method handler that also gets the
    /// context.
    pub fn add_sync_missing_method_with_context<F, R, E>(&self, f: F)
    where
        F: Fn(String, Vec<Value>, RequestContext) -> std::result::Result<R, E>
            + Send
            + Sync
            + 'static,
        R: Serialize,
        E: Into<RpcError>,
    {
        self.set_missing(Method::missing(move |name, args, ctx| {
            futures::future::ready(into_outcome(f(name, args, ctx)))
        }));
    }

    /// Drop the missing-method handler.
    pub fn remove_missing_method(&self) {
        self.table.rcu(|current| {
            let mut next = MethodTable::clone(current);
            next.missing = None;
            next
        });
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the registered key for a name inside a namespace.
fn qualify(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

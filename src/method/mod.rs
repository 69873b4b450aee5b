//! Method module - invocable methods and their registry.
//!
//! Provides:
//! - [`Method`] - a named, arity-tagged invoker
//! - [`MethodRegistry`] - (fullname, arity) keyed lookup with a
//!   missing-method fallback
//! - [`Handler`] / [`SyncHandler`] - typed closure adapters
//!
//! # Example
//!
//! ```ignore
//! use procwire_server::method::MethodRegistry;
//!
//! let registry = MethodRegistry::new();
//!
//! registry.add_fn("sum", |a: i64, b: i64, c: i64| async move {
//!     Ok::<_, RpcError>(a + b + c)
//! })?;
//!
//! registry.add_sync_fn("hello", |name: String| Ok::<_, RpcError>(format!("Hello {name}")))?;
//! ```

mod registry;
mod typed;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ProcwireError, Result, RpcError};
use crate::handler::RequestContext;

pub use registry::{
    ArityFilter, InstanceMethods, MethodRegistry, StaticMethods, INTROSPECTION_METHOD,
    RESERVED_PREFIX,
};
pub use typed::{Handler, SyncHandler};

/// Future returned by every invoker.
pub type MethodFuture = BoxFuture<'static, Result<Value>>;

/// Positional invoker: `(args, ctx)`.
pub type PositionalFn = Arc<dyn Fn(Vec<Value>, RequestContext) -> MethodFuture + Send + Sync>;

/// Missing-method invoker: `(fullname, args, ctx)`.
pub type MissingFn =
    Arc<dyn Fn(String, Vec<Value>, RequestContext) -> MethodFuture + Send + Sync>;

/// Declared parameter count of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arity {
    /// Exactly this many positional arguments.
    Fixed(usize),
    /// Any number of arguments.
    Variadic,
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Fixed(n) => write!(f, "{n}"),
            Arity::Variadic => f.write_str("*"),
        }
    }
}

/// How a method is called.
#[derive(Clone)]
pub enum Invoker {
    /// Regular method, receives the positional arguments.
    Positional(PositionalFn),
    /// Missing-method fallback, also receives the requested fullname.
    Missing(MissingFn),
}

/// A registered, invocable method.
///
/// Instance methods capture their target (an `Arc<T>`) inside the invoker;
/// the registry never owns it directly.
#[derive(Clone)]
pub struct Method {
    fullname: String,
    arity: Arity,
    invoker: Invoker,
}

impl Method {
    /// Create a method from a raw positional invoker.
    pub fn new<F, Fut>(fullname: impl Into<String>, arity: Arity, f: F) -> Self
    where
        F: Fn(Vec<Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let invoker: PositionalFn =
            Arc::new(move |args: Vec<Value>, ctx: RequestContext| -> MethodFuture {
                Box::pin(f(args, ctx))
            });
        Self {
            fullname: fullname.into(),
            arity,
            invoker: Invoker::Positional(invoker),
        }
    }

    /// Create a method from an async typed closure. Arity is the closure's
    /// parameter count.
    pub fn from_fn<H, Args>(fullname: impl Into<String>, handler: H) -> Self
    where
        H: Handler<Args>,
        Args: 'static,
    {
        let invoker: PositionalFn =
            Arc::new(move |args: Vec<Value>, _ctx: RequestContext| handler.call(args));
        Self {
            fullname: fullname.into(),
            arity: Arity::Fixed(H::ARITY),
            invoker: Invoker::Positional(invoker),
        }
    }

    /// Create a method from a synchronous typed closure.
    pub fn from_sync_fn<H, Args>(fullname: impl Into<String>, handler: H) -> Self
    where
        H: SyncHandler<Args>,
        Args: 'static,
    {
        let invoker: PositionalFn =
            Arc::new(move |args: Vec<Value>, _ctx: RequestContext| handler.call(args));
        Self {
            fullname: fullname.into(),
            arity: Arity::Fixed(H::ARITY),
            invoker: Invoker::Positional(invoker),
        }
    }

    /// Create a missing-method fallback.
    pub fn missing<F, Fut>(f: F) -> Self
    where
        F: Fn(String, Vec<Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let invoker: MissingFn = Arc::new(
            move |name: String, args: Vec<Value>, ctx: RequestContext| -> MethodFuture {
                Box::pin(f(name, args, ctx))
            },
        );
        Self {
            fullname: "*".to_string(),
            arity: Arity::Variadic,
            invoker: Invoker::Missing(invoker),
        }
    }

    /// Fully qualified name.
    #[inline]
    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    /// Declared arity.
    #[inline]
    pub fn arity(&self) -> Arity {
        self.arity
    }

    /// The invoker.
    #[inline]
    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    /// Whether this is a missing-method fallback.
    #[inline]
    pub fn is_missing(&self) -> bool {
        matches!(self.invoker, Invoker::Missing(_))
    }

    /// Copy of this method registered under another name.
    pub(crate) fn renamed(&self, fullname: String) -> Self {
        Self {
            fullname,
            arity: self.arity,
            invoker: self.invoker.clone(),
        }
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("fullname", &self.fullname)
            .field("arity", &self.arity)
            .field("missing", &self.is_missing())
            .finish()
    }
}

/// Serialize a method's return value.
pub(crate) fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| {
        ProcwireError::Invocation(RpcError::internal(format!(
            "cannot serialize result: {e}"
        )))
    })
}

/// Map an application result into the dispatcher's result.
pub(crate) fn into_outcome<T, E>(result: std::result::Result<T, E>) -> Result<Value>
where
    T: Serialize,
    E: Into<RpcError>,
{
    match result {
        Ok(value) => to_value(value),
        Err(err) => Err(ProcwireError::Invocation(err.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_raw_method() {
        let method = Method::new("echo", Arity::Variadic, |args, _ctx| async move {
            Ok(Value::Array(args))
        });

        assert_eq!(method.fullname(), "echo");
        assert_eq!(method.arity(), Arity::Variadic);
        assert!(!method.is_missing());

        let Invoker::Positional(f) = method.invoker() else {
            panic!("expected positional invoker");
        };
        let out = f(vec![json!(1), json!("a")], RequestContext::new())
            .await
            .unwrap();
        assert_eq!(out, json!([1, "a"]));
    }

    #[tokio::test]
    async fn test_missing_method() {
        let method = Method::missing(|name, args, _ctx| async move {
            Ok(json!({ "name": name, "argc": args.len() }))
        });
        assert!(method.is_missing());

        let Invoker::Missing(f) = method.invoker() else {
            panic!("expected missing invoker");
        };
        let out = f("foo.bar".into(), vec![json!(1)], RequestContext::new())
            .await
            .unwrap();
        assert_eq!(out, json!({ "name": "foo.bar", "argc": 1 }));
    }

    #[test]
    fn test_arity_display() {
        assert_eq!(Arity::Fixed(3).to_string(), "3");
        assert_eq!(Arity::Variadic.to_string(), "*");
    }

    #[test]
    fn test_into_outcome_wraps_application_error() {
        let err = into_outcome::<(), _>(Err("nope")).unwrap_err();
        match err {
            ProcwireError::Invocation(inner) => assert_eq!(inner.message, "nope"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(into_outcome::<_, RpcError>(Ok(())).unwrap(), Value::Null);
    }
}

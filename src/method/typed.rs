//! Typed closure adapters.
//!
//! Closures of 0 to 8 parameters are turned into positional invokers. Each
//! parameter is deserialized from the matching positional argument, the
//! return value is serialized back into a [`Value`].
//!
//! Every parameter counts toward the arity, `Option<T>` ones included: a
//! caller omitting an optional argument must send an explicit `null`, or the
//! method must be registered under each arity it accepts.
//!
//! Async closures implement [`Handler`]; plain closures implement
//! [`SyncHandler`] and are lifted into an already-completed future, so the
//! dispatcher always awaits the same shape.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{into_outcome, MethodFuture};
use crate::error::{ProcwireError, Result, RpcError};

/// An async closure usable as a method.
///
/// `Args` is a tuple of the parameter types; it only exists to keep the
/// per-arity impls apart.
pub trait Handler<Args>: Send + Sync + 'static {
    /// Declared parameter count.
    const ARITY: usize;

    /// Invoke with positional arguments.
    fn call(&self, args: Vec<Value>) -> MethodFuture;
}

/// A synchronous closure usable as a method.
pub trait SyncHandler<Args>: Send + Sync + 'static {
    /// Declared parameter count.
    const ARITY: usize;

    /// Invoke with positional arguments.
    fn call(&self, args: Vec<Value>) -> MethodFuture;
}

/// Take the next positional argument and convert it.
fn next_arg<T: DeserializeOwned>(
    args: &mut std::vec::IntoIter<Value>,
    position: usize,
) -> Result<T> {
    let value = args.next().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| ProcwireError::InvalidParams(format!("argument {position}: {e}")))
}

macro_rules! impl_handlers {
    ($arity:expr; $($ty:ident),*) => {
        #[allow(non_snake_case, unused_mut, unused_variables, unused_assignments)]
        impl<F, Fut, R, E, $($ty,)*> Handler<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
            R: Serialize,
            E: Into<RpcError>,
            $($ty: DeserializeOwned + Send + 'static,)*
        {
            const ARITY: usize = $arity;

            fn call(&self, args: Vec<Value>) -> MethodFuture {
                let f = self.clone();
                Box::pin(async move {
                    let mut args = args.into_iter();
                    let mut position = 0;
                    $(
                        let $ty = next_arg::<$ty>(&mut args, position)?;
                        position += 1;
                    )*
                    into_outcome(f($($ty),*).await)
                })
            }
        }

        #[allow(non_snake_case, unused_mut, unused_variables, unused_assignments)]
        impl<F, R, E, $($ty,)*> SyncHandler<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> std::result::Result<R, E> + Clone + Send + Sync + 'static,
            R: Serialize,
            E: Into<RpcError>,
            $($ty: DeserializeOwned + Send + 'static,)*
        {
            const ARITY: usize = $arity;

            fn call(&self, args: Vec<Value>) -> MethodFuture {
                let f = self.clone();
                Box::pin(async move {
                    let mut args = args.into_iter();
                    let mut position = 0;
                    $(
                        let $ty = next_arg::<$ty>(&mut args, position)?;
                        position += 1;
                    )*
                    into_outcome(f($($ty),*))
                })
            }
        }
    };
}

impl_handlers!(0;);
impl_handlers!(1; A1);
impl_handlers!(2; A1, A2);
impl_handlers!(3; A1, A2, A3);
impl_handlers!(4; A1, A2, A3, A4);
impl_handlers!(5; A1, A2, A3, A4, A5);
impl_handlers!(6; A1, A2, A3, A4, A5, A6);
impl_handlers!(7; A1, A2, A3, A4, A5, A6, A7);
impl_handlers!(8; A1, A2, A3, A4, A5, A6, A7, A8);

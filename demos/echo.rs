//! Echo Server - in-memory request/response example.
//!
//! This example demonstrates:
//! - Building a dispatcher with the builder pattern
//! - Registering typed methods, a namespace and a missing-method fallback
//! - Adding call-level middleware
//! - Feeding encoded requests through `handle` the way a transport would
//!
//! ```text
//! cargo run --example echo
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use procwire_server::codec::{MsgPackServiceCodec, RequestEnvelope};
use procwire_server::handler::{InvokeHandler, NextInvoke};
use procwire_server::method::{Method, StaticMethods};
use procwire_server::{Dispatcher, RequestContext, Result, RpcError};

/// Input structure for the echo method.
#[derive(Deserialize, Debug)]
struct EchoInput {
    message: String,
}

/// Output structure for the echo method.
#[derive(Serialize, Debug)]
struct EchoOutput {
    echo: String,
}

struct MathOps;

impl StaticMethods for MathOps {
    fn static_methods() -> Vec<Method> {
        vec![
            Method::from_sync_fn("add", |a: f64, b: f64| Ok::<_, RpcError>(a + b)),
            Method::from_sync_fn("div", |a: f64, b: f64| {
                if b == 0.0 {
                    Err(RpcError::new("E_DIV_ZERO", "division by zero"))
                } else {
                    Ok(a / b)
                }
            }),
        ]
    }
}

/// Logs every call with its duration.
struct Timing;

impl InvokeHandler for Timing {
    fn handle<'a>(
        &'a self,
        name: &'a str,
        args: Vec<Value>,
        ctx: &'a mut RequestContext,
        next: NextInvoke<'a>,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let started = Instant::now();
            let result = next.run(name, args, ctx).await;
            println!("  [{}] {:?}", name, started.elapsed());
            result
        })
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let dispatcher = Dispatcher::builder()
        .timeout(Duration::from_secs(5))
        .build();

    dispatcher.methods().add_fn("echo", |input: EchoInput| async move {
        Ok::<_, RpcError>(EchoOutput {
            echo: input.message,
        })
    })?;
    dispatcher.methods().add_static_methods::<MathOps>("math")?;
    dispatcher
        .methods()
        .add_sync_missing_method(|name: String, _args: Vec<Value>| {
            Err::<(), _>(format!("no such method: {name}"))
        });
    dispatcher.use_invoke_handler(Arc::new(Timing));

    let calls = vec![
        RequestEnvelope::new("echo", vec![json!({ "message": "hello" })]),
        RequestEnvelope::new("math.add", vec![json!(1.5), json!(2)]),
        RequestEnvelope::new("math.div", vec![json!(1), json!(0)]),
        RequestEnvelope::new("$methods", vec![]),
        RequestEnvelope::new("nothing.here", vec![]),
    ];

    for call in calls {
        println!("-> {} {:?}", call.method, call.args);
        let request = MsgPackServiceCodec::encode_request(&call)?;

        let mut ctx = RequestContext::new().with_peer("demo");
        let response = dispatcher.handle(request, &mut ctx).await?;

        match MsgPackServiceCodec::decode_response(&response)?.into_outcome() {
            Ok(value) => println!("<- {value}"),
            Err(err) => println!("<- error {err}"),
        }
    }

    Ok(())
}

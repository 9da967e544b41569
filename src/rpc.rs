//! RPC layer: envelopes, callable adapters, and stubs.
//!
//! RPC is built entirely on pub/sub. `expose` registers a callable under an
//! address and subscribes an internal handler to that address's invocation
//! channel; a call publishes an invocation envelope and collects correlated
//! responses on a per-call reply channel. The in-flight bookkeeping,
//! reply collection, and timeout handling live in [`crate::bus`]; this
//! module owns the wire envelopes, the shared RPC state, and the glue that
//! turns ordinary Rust functions into transport-callable handlers.

use std::collections::HashMap;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bus::Bus;
use crate::dispatch::SubscriptionId;
use crate::error::BusResult;

/// Invocation channels live under this namespace
pub const RPC_CHANNEL_PREFIX: &str = "__rpc__.";

/// Per-call reply channels live under this namespace
pub const RPC_REPLY_PREFIX: &str = "__rpc_reply__.";

/// Invocation envelope published on `__rpc__.<address>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RpcRequest {
    /// Unique correlation token for this call
    pub id: String,
    /// Channel responses are delivered on
    pub reply_channel: String,
    /// RPC address of the target callable
    pub function: String,
    /// Positional arguments, encoded as an array
    pub args: Value,
}

/// Response envelope published on the invocation's reply channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Correlation token echoing the invocation
    pub id: String,
    /// Opaque identity of the responder
    pub responder: String,
    /// Encoded return value; `None` on failure
    pub result: Option<Value>,
    /// Error text; `None` on success
    pub error: Option<String>,
}

impl RpcResponse {
    /// Narrow this response to a declared return type, or surface the
    /// remote error
    pub fn into_result<R: DeserializeOwned>(self, addr: &str) -> BusResult<R> {
        if let Some(detail) = self.error {
            return Err(crate::error::BusError::Rpc {
                addr: addr.to_string(),
                detail,
            });
        }
        crate::codec::from_value(self.result.unwrap_or(Value::Null))
    }
}

/// A type-erased exposed callable: decodes its arguments, runs, and encodes
/// its outcome. The error branch carries the text placed in the response
/// envelope.
pub trait RpcCallable: Send + Sync + 'static {
    /// Invoke with encoded positional arguments
    fn invoke(&self, args: Value) -> Result<Value, String>;
}

impl<F> RpcCallable for F
where
    F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
{
    fn invoke(&self, args: Value) -> Result<Value, String> {
        self(args)
    }
}

/// Conversion glue from ordinary functions into [`RpcCallable`]s.
///
/// Implemented for `Fn(A1, .., An) -> Result<R, E>` up to four arguments,
/// with `Ai: DeserializeOwned`, `R: Serialize`, `E: Display`. The `Args`
/// parameter only disambiguates arities and is inferred.
pub trait IntoRpcCallable<Args> {
    /// Erase the function into a shared callable
    fn into_callable(self) -> Arc<dyn RpcCallable>;
}

macro_rules! impl_into_rpc_callable {
    ($($arg:ident),+) => {
        impl<Func, Ret, E, $($arg,)+> IntoRpcCallable<($($arg,)+)> for Func
        where
            Func: Fn($($arg),+) -> Result<Ret, E> + Send + Sync + 'static,
            Ret: Serialize,
            E: Display,
            $($arg: DeserializeOwned,)+
        {
            fn into_callable(self) -> Arc<dyn RpcCallable> {
                Arc::new(move |args: Value| {
                    #[allow(non_snake_case)]
                    let ($($arg,)+): ($($arg,)+) = serde_json::from_value(args)
                        .map_err(|e| format!("invalid arguments: {e}"))?;
                    match catch_unwind(AssertUnwindSafe(|| (self)($($arg),+))) {
                        Ok(Ok(value)) => serde_json::to_value(value)
                            .map_err(|e| format!("failed to encode return value: {e}")),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err("callable panicked".to_string()),
                    }
                })
            }
        }
    };
}

impl_into_rpc_callable!(A1);
impl_into_rpc_callable!(A1, A2);
impl_into_rpc_callable!(A1, A2, A3);
impl_into_rpc_callable!(A1, A2, A3, A4);

// Nullary callables ignore the (empty) argument array entirely
impl<Func, Ret, E> IntoRpcCallable<()> for Func
where
    Func: Fn() -> Result<Ret, E> + Send + Sync + 'static,
    Ret: Serialize,
    E: Display,
{
    fn into_callable(self) -> Arc<dyn RpcCallable> {
        Arc::new(move |_args: Value| {
            match catch_unwind(AssertUnwindSafe(|| (self)())) {
                Ok(Ok(value)) => serde_json::to_value(value)
                    .map_err(|e| format!("failed to encode return value: {e}")),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("callable panicked".to_string()),
            }
        })
    }
}

/// Derive a canonical RPC address (`module::path::function`) from a callable
/// reference.
///
/// Works for named functions and methods turned into function references;
/// closures yield their compiler-generated name and should use explicit
/// addresses instead.
pub fn rpc_address<F: ?Sized>(_f: &F) -> String {
    std::any::type_name::<F>().to_string()
}

/// One registered responder
pub(crate) struct ExposedEntry {
    pub callable: Arc<dyn RpcCallable>,
    pub subscription: SubscriptionId,
}

/// Shared RPC bookkeeping owned by the bus
pub(crate) struct RpcState {
    /// Address → registered callable; at most one per address per bus
    pub exposed: Mutex<HashMap<String, ExposedEntry>>,
    /// Correlation id → reply sink for in-flight invocations
    pub pending: Mutex<HashMap<String, mpsc::UnboundedSender<RpcResponse>>>,
}

impl RpcState {
    pub(crate) fn new() -> Self {
        Self {
            exposed: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }
}

/// A bound call handle returned by [`Bus::stub`](crate::Bus::stub).
///
/// Carries the target address and an optional deadline; calling it behaves
/// exactly like the corresponding `rpc` method.
#[derive(Clone)]
pub struct Stub {
    bus: Bus,
    addr: String,
    timeout: Option<Duration>,
}

impl Stub {
    pub(crate) fn new(bus: Bus, addr: &str) -> Self {
        Self {
            bus,
            addr: addr.to_string(),
            timeout: None,
        }
    }

    /// The address this stub calls
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Set a deadline applied to every call through this stub
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Invoke the remote callable with a tuple of arguments and await a
    /// single response
    pub async fn call<A: Serialize, R: DeserializeOwned>(&self, args: A) -> BusResult<R> {
        match self.timeout {
            Some(timeout) => self.bus.rpc_timeout(&self.addr, args, timeout).await,
            None => self.bus.rpc(&self.addr, args).await,
        }
    }

    /// Invoke the remote callable and collect every response arriving within
    /// the stub's deadline (or the default collection window)
    pub async fn call_multi<A: Serialize>(&self, args: A) -> BusResult<Vec<RpcResponse>> {
        let timeout = self.timeout.unwrap_or(crate::defaults::MULTI_CALL_TIMEOUT);
        self.bus.rpc_multi(&self.addr, args, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(a: i64, b: i64) -> Result<i64, String> {
        Ok(a * b)
    }

    #[test]
    fn address_derivation_is_fully_qualified() {
        let addr = rpc_address(&product);
        assert!(addr.ends_with("product"), "derived address: {addr}");
        assert!(addr.contains("::"));
    }

    #[test]
    fn callable_decodes_args_and_encodes_result() {
        let callable = product.into_callable();
        let result = callable.invoke(serde_json::json!([6, 7])).unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[test]
    fn callable_reports_bad_arguments() {
        let callable = product.into_callable();
        let err = callable.invoke(serde_json::json!(["six", 7])).unwrap_err();
        assert!(err.contains("invalid arguments"), "error was: {err}");
    }

    #[test]
    fn callable_error_branch_becomes_text() {
        fn divide(a: i64, b: i64) -> Result<i64, String> {
            if b == 0 {
                return Err("division by zero".to_string());
            }
            Ok(a / b)
        }
        let callable = divide.into_callable();
        let err = callable.invoke(serde_json::json!([1, 0])).unwrap_err();
        assert_eq!(err, "division by zero");
    }

    #[test]
    fn callable_panic_is_captured() {
        fn explode(_n: i64) -> Result<i64, String> {
            panic!("kaboom");
        }
        let callable = explode.into_callable();
        let err = callable.invoke(serde_json::json!([1])).unwrap_err();
        assert_eq!(err, "callable panicked");
    }

    #[test]
    fn nullary_callable_ignores_args() {
        fn answer() -> Result<i64, String> {
            Ok(42)
        }
        let callable = answer.into_callable();
        assert_eq!(callable.invoke(Value::Null).unwrap(), serde_json::json!(42));
    }
}

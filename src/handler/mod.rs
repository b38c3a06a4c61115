//! Handler module - serving inbound calls.
//!
//! Provides:
//! - [`Service`] - what a server connection runs for every inbound request
//! - [`service_fn`] - adapts an async closure into a `Service`
//! - [`MethodRegistry`] - a `Service` that dispatches typed handlers by method ID
//! - [`envelope`] - the byte layout of typed requests and responses
//!
//! # Example
//!
//! ```
//! use muxwire::handler::{service_fn, MethodRegistry};
//!
//! // Raw bytes in, raw bytes out.
//! let echo = service_fn(|request: Vec<u8>| async move { request });
//!
//! // Typed methods, MsgPack-encoded.
//! let mut registry = MethodRegistry::new();
//! let add = registry.register("add", |(a, b): (i64, i64)| async move { Ok(a + b) });
//! assert_eq!(registry.method_id("add"), Some(add));
//! ```

pub mod envelope;
mod registry;

use std::future::Future;
use std::pin::Pin;

pub use registry::{Handler, MethodRegistry, TypedHandler};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Turns one complete request message into one complete response message.
///
/// Application-level failures are part of the response bytes; a service
/// always answers.
pub trait Service: Send + Sync + 'static {
    fn call(&self, request: Vec<u8>) -> BoxFuture<'static, Vec<u8>>;
}

/// A [`Service`] backed by an async closure.
pub struct ServiceFn<F> {
    f: F,
}

/// Build a [`Service`] from `Fn(Vec<u8>) -> impl Future<Output = Vec<u8>>`.
pub fn service_fn<F, Fut>(f: F) -> ServiceFn<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<u8>> + Send + 'static,
{
    ServiceFn { f }
}

impl<F, Fut> Service for ServiceFn<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<u8>> + Send + 'static,
{
    fn call(&self, request: Vec<u8>) -> BoxFuture<'static, Vec<u8>> {
        Box::pin((self.f)(request))
    }
}

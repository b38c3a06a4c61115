//! Method registry for dispatching typed calls by method ID.
//!
//! The registry maps method names to handlers and manages ID assignment.
//! IDs are assigned sequentially starting from 1 (0 is reserved), and a
//! client addresses a method by the one-byte ID.
//!
//! # Example
//!
//! ```
//! use muxwire::handler::MethodRegistry;
//!
//! let mut registry = MethodRegistry::new();
//! let echo = registry.register("echo", |text: String| async move { Ok(text) });
//!
//! assert_eq!(echo, 1);
//! assert_eq!(registry.method_name(1), Some("echo"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::envelope::{self, status};
use super::{BoxFuture, Service};
use crate::codec::MsgPackCodec;
use crate::error::{MuxError, Result};

/// Trait for typed handler functions erased to bytes.
pub trait Handler: Send + Sync + 'static {
    /// Decode `args` and start the handler.
    ///
    /// Decoding failures are returned immediately; handler failures come out
    /// of the future.
    fn call(&self, args: &[u8]) -> Result<BoxFuture<'static, Result<Vec<u8>>>>;
}

/// Wrapper that deserializes arguments before calling the handler and
/// serializes its result afterwards.
pub struct TypedHandler<F, T, R, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Handler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, args: &[u8]) -> Result<BoxFuture<'static, Result<Vec<u8>>>> {
        let parsed: T = MsgPackCodec::decode(args)?;
        let fut = (self.handler)(parsed);
        Ok(Box::pin(async move {
            let value = fut.await?;
            MsgPackCodec::encode(&value)
        }))
    }
}

/// Entry for a registered method.
struct MethodEntry {
    name: String,
    handler: Box<dyn Handler>,
}

/// Registry mapping method IDs to handlers. Serves calls as a [`Service`].
pub struct MethodRegistry {
    methods: HashMap<u8, MethodEntry>,
    ids: HashMap<String, u8>,
    next_method_id: u16,
}

impl MethodRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            ids: HashMap::new(),
            next_method_id: 1, // Start from 1, 0 is reserved
        }
    }

    /// Register a method handler and return its method ID.
    ///
    /// Registering a name twice replaces the handler and keeps the ID.
    ///
    /// # Panics
    ///
    /// Panics when registering a 256th distinct method.
    pub fn register<F, T, R, Fut>(&mut self, name: &str, handler: F) -> u8
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let id = match self.ids.get(name) {
            Some(&id) => id,
            None => {
                assert!(self.next_method_id <= u8::MAX as u16, "method id space exhausted");
                let id = self.next_method_id as u8;
                self.next_method_id += 1;
                self.ids.insert(name.to_string(), id);
                id
            }
        };

        self.methods.insert(
            id,
            MethodEntry {
                name: name.to_string(),
                handler: Box::new(TypedHandler::new(handler)),
            },
        );
        id
    }

    /// Get method ID by name.
    pub fn method_id(&self, name: &str) -> Option<u8> {
        self.ids.get(name).copied()
    }

    /// Get method name by ID.
    pub fn method_name(&self, id: u8) -> Option<&str> {
        self.methods.get(&id).map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn ready(response: Vec<u8>) -> BoxFuture<'static, Vec<u8>> {
    Box::pin(std::future::ready(response))
}

impl Service for MethodRegistry {
    fn call(&self, request: Vec<u8>) -> BoxFuture<'static, Vec<u8>> {
        let (method_id, args) = match envelope::split_request(&request) {
            Ok(parts) => parts,
            Err(e) => return ready(envelope::encode_failure(status::BAD_REQUEST, &e.to_string())),
        };

        let Some(entry) = self.methods.get(&method_id) else {
            tracing::debug!(method_id, "call for unknown method");
            return ready(envelope::encode_failure(
                status::METHOD_NOT_FOUND,
                &format!("method {} is not registered", method_id),
            ));
        };

        let pending = match entry.handler.call(args) {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(method = %entry.name, error = %e, "undecodable arguments");
                return ready(envelope::encode_failure(status::BAD_REQUEST, &e.to_string()));
            }
        };

        let name = entry.name.clone();
        Box::pin(async move {
            match pending.await {
                Ok(body) => envelope::encode_ok(&body),
                Err(e) => {
                    tracing::error!("Handler error for method {}: {}", name, e);
                    let reason = match e {
                        MuxError::Handler(reason) => reason,
                        other => other.to_string(),
                    };
                    envelope::encode_failure(status::HANDLER_ERROR, &reason)
                }
            }
        })
    }
}

//! Per-request context: path parameters, type-safe extensions, and the
//! request's cancellation token.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use tokio_util::sync::CancellationToken;

use crate::Request;

/// Type-erased request extensions map: used to inject per-request state
/// into handlers without requiring handlers to know about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create a new empty extensions map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value into the extensions map, returning the previous value of
    /// the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Get a value from the extensions map
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Get a mutable reference to a value from the extensions map
    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    /// Remove a value from the extensions map
    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Path parameters bound by the router, in binding order.
///
/// Bindings behave as a stack so that the router can undo the bindings of a
/// failed branch while backtracking.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct PathParams {
    entries: Vec<(String, String)>,
}

impl PathParams {
    /// Create a new empty parameters map
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `key` to `value`. A later binding of the same key shadows earlier ones.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Get the most recent binding of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Undo the most recent binding.
    pub(crate) fn pop(&mut self) -> Option<(String, String)> {
        self.entries.pop()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(name, value)` pairs in binding order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Everything a handler receives for one request.
pub struct Context {
    request: Request,
    extensions: Extensions,
    cancellation: CancellationToken,
}

impl Context {
    /// Create a new context from a request with a fresh cancellation token.
    pub fn new(request: Request) -> Self {
        Self::with_cancellation(request, CancellationToken::new())
    }

    /// Create a context whose cancellation is tied to `token` (typically a
    /// child of the engine's shutdown token).
    pub fn with_cancellation(request: Request, token: CancellationToken) -> Self {
        Self {
            request,
            extensions: Extensions::new(),
            cancellation: token,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn into_request(self) -> Request {
        self.request
    }

    /// Path parameters bound by the router.
    pub fn params(&self) -> &PathParams {
        self.request.params()
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Token cancelled when the request is abandoned (timeout) or the engine
    /// shuts down. Work a handler offloads to other tasks should watch it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Deserialize the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}

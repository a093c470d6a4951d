//! Locator registry.
//!
//! The worker resolves `module-path:dotted.qualified.name` locators against
//! callables registered at startup. The controller only ever sends locator
//! strings.

use super::object::{CallContext, Outcome, RemoteGenerator, RemoteObject};
use crate::error::{RemoteError, RpcError};
use crate::protocol::{CallArgs, Locator};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// A registered callable.
pub type Callable =
    Arc<dyn Fn(CallArgs, &CallContext) -> Result<Outcome, RemoteError> + Send + Sync>;

/// Callables addressable by locator.
#[derive(Clone, Default)]
pub struct Registry {
    entries: HashMap<String, Callable>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable that returns a raw [`Outcome`].
    pub fn register<F>(&mut self, locator: &str, callable: F) -> Result<&mut Self, RpcError>
    where
        F: Fn(CallArgs, &CallContext) -> Result<Outcome, RemoteError> + Send + Sync + 'static,
    {
        let locator = Locator::parse(locator)?.to_string();
        if self
            .entries
            .insert(locator.clone(), Arc::new(callable))
            .is_some()
        {
            warn!("Replaced callable registered at {}", locator);
        }
        Ok(self)
    }

    /// Register a stateless function whose result is returned by value.
    pub fn function<F, R>(&mut self, locator: &str, function: F) -> Result<&mut Self, RpcError>
    where
        F: Fn(CallArgs, &CallContext) -> Result<R, RemoteError> + Send + Sync + 'static,
        R: Serialize,
    {
        self.register(locator, move |args, ctx| {
            Outcome::value(&function(args, ctx)?)
        })
    }

    /// Register a constructor. Each call enters a new instance in the table.
    pub fn class<F, O>(&mut self, locator: &str, constructor: F) -> Result<&mut Self, RpcError>
    where
        F: Fn(CallArgs, &CallContext) -> Result<O, RemoteError> + Send + Sync + 'static,
        O: RemoteObject,
    {
        self.register(locator, move |args, ctx| {
            Ok(Outcome::instance(constructor(args, ctx)?))
        })
    }

    /// Register a callable that opens a generator session.
    pub fn generator<F, G>(&mut self, locator: &str, factory: F) -> Result<&mut Self, RpcError>
    where
        F: Fn(CallArgs, &CallContext) -> Result<G, RemoteError> + Send + Sync + 'static,
        G: RemoteGenerator,
    {
        self.register(locator, move |args, ctx| {
            Ok(Outcome::generator(factory(args, ctx)?))
        })
    }

    /// Look up the callable at `locator`.
    pub fn resolve(&self, locator: &str) -> Result<Callable, RemoteError> {
        self.entries
            .get(locator)
            .cloned()
            .ok_or_else(|| RemoteError::lookup_error(locator))
    }

    pub fn contains(&self, locator: &str) -> bool {
        self.entries.contains_key(locator)
    }

    /// Registered locators, sorted.
    pub fn locators(&self) -> Vec<&str> {
        let mut locators: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        locators.sort_unstable();
        locators
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("locators", &self.locators())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_function_resolves_and_runs() {
        let mut registry = Registry::new();
        registry
            .function("demo.math:add", |args, _ctx| {
                Ok(args.get::<i64>(0)? + args.get::<i64>(1)?)
            })
            .unwrap();

        let add = registry.resolve("demo.math:add").unwrap();
        match add(CallArgs::positional([2, 3]), &CallContext::detached()).unwrap() {
            Outcome::Value(value) => assert_eq!(value, json!(5)),
            other => panic!("Expected value, got: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_locator_rejected_at_registration() {
        let mut registry = Registry::new();
        let result = registry.function("not-a-locator", |_args, _ctx| Ok(()));
        assert!(matches!(result, Err(RpcError::InvalidLocator { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_locator_is_lookup_error() {
        let registry = Registry::new();
        let err = registry.resolve("demo:missing").err().unwrap();
        assert!(err.is_kind("LookupError"));
    }

    #[test]
    fn test_locators_sorted() {
        let mut registry = Registry::new();
        registry
            .function("b:f", |_a, _c| Ok(1))
            .unwrap()
            .function("a:f", |_a, _c| Ok(2))
            .unwrap();
        assert_eq!(registry.locators(), vec!["a:f", "b:f"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("a:f"));
    }
}

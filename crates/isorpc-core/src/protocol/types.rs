//! Values that appear inside wire messages.

use crate::error::{RemoteError, RpcError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier pairing a `call` with its reply. `0` means no reply is expected.
pub type CallId = u64;

/// Opaque reference to a worker-side instance or generator session.
///
/// Handles are allocated by the worker, monotonically from 1, and are never
/// reused within a connection.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Handle(u64);

impl Handle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `module-path:dotted.qualified.name` reference to a worker-side callable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    module: String,
    qualname: String,
}

impl Locator {
    /// Parse a locator, splitting on its last `:`.
    pub fn parse(locator: &str) -> Result<Self, RpcError> {
        let invalid = |reason: &str| RpcError::InvalidLocator {
            locator: locator.to_string(),
            reason: reason.to_string(),
        };

        let (module, qualname) = locator
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected 'module:qualified.name'"))?;

        if module.trim().is_empty() {
            return Err(invalid("module path is empty"));
        }
        if module.ends_with(':') {
            return Err(invalid("module path ends with ':'"));
        }
        if module.chars().any(char::is_whitespace) || qualname.chars().any(char::is_whitespace) {
            return Err(invalid("locator contains whitespace"));
        }
        if qualname.is_empty() {
            return Err(invalid("qualified name is empty"));
        }
        if qualname.split('.').any(str::is_empty) {
            return Err(invalid("qualified name has an empty segment"));
        }

        Ok(Self {
            module: module.to_string(),
            qualname: qualname.to_string(),
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn qualname(&self) -> &str {
        &self.qualname
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.module, self.qualname)
    }
}

impl std::str::FromStr for Locator {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Positional and keyword arguments of a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arguments from a list of positional values.
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            args: values.into_iter().map(Into::into).collect(),
            kwargs: Map::new(),
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Append any serializable value as a positional argument.
    pub fn try_arg<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, RpcError> {
        self.args.push(serde_json::to_value(value)?);
        Ok(self)
    }

    /// Set any serializable value as a keyword argument.
    pub fn try_kwarg<T: Serialize + ?Sized>(
        mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, RpcError> {
        self.kwargs.insert(name.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// Positional argument `index` converted to `T`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, RemoteError> {
        let value = self.args.get(index).ok_or_else(|| {
            RemoteError::type_error(format!("missing positional argument {}", index))
        })?;
        T::deserialize(value).map_err(|e| {
            RemoteError::type_error(format!("positional argument {}: {}", index, e))
        })
    }

    /// Positional argument `index`, or `default` when it was not supplied.
    pub fn get_or<T: DeserializeOwned>(&self, index: usize, default: T) -> Result<T, RemoteError> {
        if index < self.args.len() {
            self.get(index)
        } else {
            Ok(default)
        }
    }

    /// Keyword argument `name` converted to `T`.
    pub fn kwarg_value<T: DeserializeOwned>(&self, name: &str) -> Result<T, RemoteError> {
        let value = self.kwargs.get(name).ok_or_else(|| {
            RemoteError::type_error(format!("missing keyword argument '{}'", name))
        })?;
        T::deserialize(value)
            .map_err(|e| RemoteError::type_error(format!("keyword argument '{}': {}", name, e)))
    }

    /// Keyword argument `name`, or `default` when it was not supplied.
    pub fn kwarg_or<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T, RemoteError> {
        if self.kwargs.contains_key(name) {
            self.kwarg_value(name)
        } else {
            Ok(default)
        }
    }
}

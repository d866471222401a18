use std::{collections::HashMap, sync::Arc};

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::cache::FactorCache;

/// Caller-supplied values that factors evaluate against (user id, ip, ...).
pub type Attributes = HashMap<String, AttributeValue>;

/// The value of one context attribute.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string.
    String(String),
    /// A number. Integers are stored as `f64`.
    Number(f64),
    /// A boolean.
    Boolean(bool),
    /// An explicit null.
    Null,
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl AttributeValue {
    /// The string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The numeric value, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The boolean value, if this is a boolean.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns `true` for [`AttributeValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }
}

/// The calling context of an evaluation.
///
/// `Context` is passed through untouched to every factor dispatch. It carries the caller's
/// [`Attributes`] and, once opted in with [`Context::use_cache`], the factor cache shared by every
/// evaluation made with this context or any of its clones.
///
/// Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct Context {
    attributes: Arc<Attributes>,
    cache: Option<Arc<FactorCache>>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Context {
        Context::default()
    }

    /// Create a context from caller attributes.
    pub fn from_attributes(attributes: Attributes) -> Context {
        Context {
            attributes: Arc::new(attributes),
            cache: None,
        }
    }

    /// Add or replace one attribute.
    ///
    /// ```
    /// # use switch_sdk::Context;
    /// let ctx = Context::new().with_attribute("user_name", "alice");
    /// assert_eq!(ctx.get("user_name").and_then(|v| v.as_str()), Some("alice"));
    /// ```
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Context {
        Arc::make_mut(&mut self.attributes).insert(key.into(), value.into());
        self
    }

    /// The attribute named `key`.
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// All attributes.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Opt this call chain into factor caching.
    ///
    /// Returns a new context carrying a fresh [`FactorCache`]. Switches that have `use_cache` set
    /// then coalesce identical concurrent factor dispatches and reuse the last result per
    /// (switch, factor) as long as the config is unchanged. The cache never expires; it lives as
    /// long as the returned context or one of its clones.
    pub fn use_cache(&self) -> Context {
        Context {
            attributes: Arc::clone(&self.attributes),
            cache: Some(Arc::new(FactorCache::new())),
        }
    }

    /// Returns `true` if this context was opted into caching.
    pub fn is_cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub(crate) fn factor_cache(&self) -> Option<&FactorCache> {
        self.cache.as_deref()
    }
}

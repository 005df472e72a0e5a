//! Gate restricting which handler/method pairs may run.
//!
//! Handler and method names arrive as free-form strings and drive dynamic
//! dispatch, so anything not listed here is rejected before it reaches the
//! invoker or the durable store.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Immutable handler → permitted-methods table, built from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllowList {
    jobs: BTreeMap<String, BTreeSet<String>>,
}

impl AllowList {
    /// An allow-list that permits nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The jobs approved out of the box.
    pub fn builtin() -> Self {
        Self::empty()
            .permit("SendWelcomeEmail", ["handle"])
            .permit("SendPasswordResetEmail", ["handle", "sendResetLink"])
            .permit("Greeter", ["sayHello"])
    }

    /// Add `methods` to the permitted set of `handler`.
    pub fn permit<I, S>(mut self, handler: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.jobs
            .entry(handler.into())
            .or_default()
            .extend(methods.into_iter().map(Into::into));
        self
    }

    pub fn validate(&self, handler: &str, method: &str) -> bool {
        self.jobs
            .get(handler)
            .is_some_and(|methods| methods.contains(method))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.jobs.iter()
    }
}

//! Call a registered handler method by name.
//!
//! Resolution order: handler descriptor, constructor arguments, instance,
//! method descriptor, method arguments, call. Arguments are matched by the
//! declared parameter name, so those names are a contract with callers.

mod args;
mod registry;

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::InvocationError;
use crate::params::Params;

pub use args::BoundArgs;
pub use registry::{HandlerBuilder, HandlerDescriptor, HandlerRegistry};

/// Binding policy for parameters the caller did not supply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Binding {
    /// Bind absent names to `None` and let the handler decide.
    #[default]
    Lenient,
    /// Reject the attempt with `MissingParameter` before constructing anything.
    Strict,
}

#[derive(Debug, Clone)]
pub struct Invoker {
    registry: Arc<HandlerRegistry>,
    binding: Binding,
}

impl Invoker {
    pub fn new(registry: Arc<HandlerRegistry>, binding: Binding) -> Self {
        Self { registry, binding }
    }

    pub fn invoke(
        &self,
        handler: &str,
        method: &str,
        params: &Params,
    ) -> Result<Value, InvocationError> {
        let descriptor = self
            .registry
            .get(handler)
            .ok_or_else(|| InvocationError::UnknownHandler(handler.to_string()))?;

        let init_args = self.bind(descriptor.init_params(), params)?;
        let mut instance = descriptor.construct(&init_args)?;

        let target = descriptor
            .method(method)
            .ok_or_else(|| InvocationError::UnknownMethod {
                handler: handler.to_string(),
                method: method.to_string(),
            })?;

        let method_args = self.bind(target.params(), params)?;
        debug!(handler, method, args = ?method_args, "invoking handler method");
        target.call(instance.as_mut(), &method_args)
    }

    fn bind(&self, names: &[&'static str], params: &Params) -> Result<BoundArgs, InvocationError> {
        let args = BoundArgs::bind(names, params);
        if self.binding == Binding::Strict {
            if let Some(name) = args.unresolved().first() {
                return Err(InvocationError::MissingParameter(name.to_string()));
            }
        }
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Counter {
        start: i64,
    }

    struct Greeter;

    fn registry(log: Arc<Mutex<Vec<String>>>) -> Arc<HandlerRegistry> {
        let ctor_log = Arc::clone(&log);
        let registry = HandlerRegistry::new()
            .with(
                HandlerBuilder::new("Greeter", &[], |_| Ok(Greeter))
                    .method("sayHello", &["name"], |_: &mut Greeter, args| {
                        Ok(format!("Hello, {}!", args.text("name")?))
                    })
                    .build(),
            )
            .with(
                HandlerBuilder::new("Counter", &["start"], move |args| {
                    ctor_log.lock().unwrap().push("constructed".into());
                    Ok(Counter {
                        start: args.get("start").map_or(Ok(0), |_| args.int("start"))?,
                    })
                })
                .method("add", &["by", "times"], |counter: &mut Counter, args| {
                    let times = args.get("times").map_or(Ok(1), |_| args.int("times"))?;
                    Ok(counter.start + args.int("by")? * times)
                })
                .method("explode", &[], |_: &mut Counter, _| {
                    Err::<(), _>(InvocationError::Failed("boom".into()))
                })
                .build(),
            );
        Arc::new(registry)
    }

    fn invoker(binding: Binding) -> (Invoker, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (Invoker::new(registry(Arc::clone(&log)), binding), log)
    }

    #[test]
    fn calls_method_with_named_params() {
        let (invoker, _) = invoker(Binding::Lenient);
        let params = Params::parse(["name=Ada"]).unwrap();
        let out = invoker.invoke("Greeter", "sayHello", &params).unwrap();
        assert_eq!(out, Value::String("Hello, Ada!".into()));
    }

    #[test]
    fn constructor_and_method_share_the_parameter_map() {
        let (invoker, _) = invoker(Binding::Lenient);
        let params = Params::parse(["start=10", "by=3", "times=2"]).unwrap();
        let out = invoker.invoke("Counter", "add", &params).unwrap();
        assert_eq!(out, Value::from(16));
    }

    #[test]
    fn missing_values_bind_as_none_by_default() {
        let (invoker, _) = invoker(Binding::Lenient);
        let params = Params::parse(["by=4"]).unwrap();
        let out = invoker.invoke("Counter", "add", &params).unwrap();
        assert_eq!(out, Value::from(4));
    }

    #[test]
    fn missing_value_surfaces_when_the_handler_needs_it() {
        let (invoker, _) = invoker(Binding::Lenient);
        let err = invoker
            .invoke("Greeter", "sayHello", &Params::new())
            .unwrap_err();
        assert_eq!(err, InvocationError::MissingParameter("name".into()));
    }

    #[test]
    fn strict_binding_fails_before_construction() {
        let (invoker, log) = invoker(Binding::Strict);
        let params = Params::parse(["by=4"]).unwrap();
        let err = invoker.invoke("Counter", "add", &params).unwrap_err();
        assert_eq!(err, InvocationError::MissingParameter("start".into()));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_handler() {
        let (invoker, _) = invoker(Binding::Lenient);
        let err = invoker.invoke("Nope", "x", &Params::new()).unwrap_err();
        assert_eq!(err, InvocationError::UnknownHandler("Nope".into()));
    }

    #[test]
    fn unknown_method_is_resolved_after_construction() {
        let (invoker, log) = invoker(Binding::Lenient);
        let err = invoker.invoke("Counter", "reset", &Params::new()).unwrap_err();
        assert_eq!(
            err,
            InvocationError::UnknownMethod {
                handler: "Counter".into(),
                method: "reset".into(),
            }
        );
        assert_eq!(log.lock().unwrap().as_slice(), ["constructed"]);
    }

    #[test]
    fn handler_failure_is_propagated() {
        let (invoker, _) = invoker(Binding::Lenient);
        let err = invoker
            .invoke("Counter", "explode", &Params::new())
            .unwrap_err();
        assert_eq!(err, InvocationError::Failed("boom".into()));
    }
}

use std::any::Any;
use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::Serialize;
use serde_json::Value;

use super::args::BoundArgs;
use crate::error::InvocationError;

/// Type-erased handler instance produced by a constructor.
pub type Instance = Box<dyn Any + Send>;

type Constructor = Box<dyn Fn(&BoundArgs) -> Result<Instance, InvocationError> + Send + Sync>;
type MethodFn =
    Box<dyn Fn(&mut (dyn Any + Send), &BoundArgs) -> Result<Value, InvocationError> + Send + Sync>;

/// A callable method: its declared parameter names and the function behind it.
pub struct MethodDescriptor {
    params: Vec<&'static str>,
    call: MethodFn,
}

impl MethodDescriptor {
    pub fn params(&self) -> &[&'static str] {
        &self.params
    }

    pub(super) fn call(
        &self,
        instance: &mut (dyn Any + Send),
        args: &BoundArgs,
    ) -> Result<Value, InvocationError> {
        (self.call)(instance, args)
    }
}

/// Everything needed to construct a handler and call its methods by name.
pub struct HandlerDescriptor {
    name: String,
    init_params: Vec<&'static str>,
    construct: Constructor,
    methods: BTreeMap<String, MethodDescriptor>,
}

impl HandlerDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init_params(&self) -> &[&'static str] {
        &self.init_params
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = (&String, &MethodDescriptor)> {
        self.methods.iter()
    }

    pub(super) fn construct(&self, args: &BoundArgs) -> Result<Instance, InvocationError> {
        (self.construct)(args)
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("init_params", &self.init_params)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Typed builder for a [`HandlerDescriptor`].
///
/// The closures see the concrete handler type `T`; the descriptor erases it so
/// handlers of different types can share one registry.
pub struct HandlerBuilder<T> {
    descriptor: HandlerDescriptor,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send> HandlerBuilder<T> {
    pub fn new<F>(name: impl Into<String>, init_params: &[&'static str], construct: F) -> Self
    where
        F: Fn(&BoundArgs) -> Result<T, InvocationError> + Send + Sync + 'static,
    {
        let construct: Constructor = Box::new(move |args: &BoundArgs| {
            construct(args).map(|handler| Box::new(handler) as Instance)
        });
        Self {
            descriptor: HandlerDescriptor {
                name: name.into(),
                init_params: init_params.to_vec(),
                construct,
                methods: BTreeMap::new(),
            },
            _marker: PhantomData,
        }
    }

    pub fn method<R, F>(mut self, name: impl Into<String>, params: &[&'static str], call: F) -> Self
    where
        R: Serialize,
        F: Fn(&mut T, &BoundArgs) -> Result<R, InvocationError> + Send + Sync + 'static,
    {
        let handler_name = self.descriptor.name.clone();
        let call: MethodFn = Box::new(
            move |instance: &mut (dyn Any + Send), args: &BoundArgs| {
                let target = instance.downcast_mut::<T>().ok_or_else(|| {
                    InvocationError::Failed(format!("instance is not a `{handler_name}`"))
                })?;
                let output = call(target, args)?;
                serde_json::to_value(output).map_err(|e| InvocationError::Failed(e.to_string()))
            },
        );
        self.descriptor.methods.insert(
            name.into(),
            MethodDescriptor {
                params: params.to_vec(),
                call,
            },
        );
        self
    }

    pub fn build(self) -> HandlerDescriptor {
        self.descriptor
    }
}

/// Handler name → descriptor table, built once at startup.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, HandlerDescriptor>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(&mut self, descriptor: HandlerDescriptor) -> &mut Self {
        self.handlers.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn with(mut self, descriptor: HandlerDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&HandlerDescriptor> {
        self.handlers.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerDescriptor> {
        self.handlers.values()
    }
}

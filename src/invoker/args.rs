use crate::error::InvocationError;
use crate::params::{ParamValue, Params};

/// Arguments bound by declared parameter name.
///
/// Slots keep the declaration order. A name absent from the submitted
/// parameters is bound to `None` rather than rejected; the typed accessors
/// turn an absent value into [`InvocationError::MissingParameter`] only when
/// the handler actually asks for it.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundArgs {
    slots: Vec<(&'static str, Option<ParamValue>)>,
}

impl BoundArgs {
    pub fn bind(names: &[&'static str], params: &Params) -> Self {
        let slots = names
            .iter()
            .map(|&name| (name, params.get(name).cloned()))
            .collect();
        Self { slots }
    }

    /// Declared names that received no value.
    pub fn unresolved(&self) -> Vec<&'static str> {
        self.slots
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.slots
            .iter()
            .find(|(slot, _)| *slot == name)
            .and_then(|(_, value)| value.as_ref())
    }

    fn require(&self, name: &str) -> Result<&ParamValue, InvocationError> {
        self.get(name)
            .ok_or_else(|| InvocationError::MissingParameter(name.to_string()))
    }

    /// Text value; numbers are rendered back to their literal form.
    pub fn text(&self, name: &str) -> Result<String, InvocationError> {
        self.require(name).map(ToString::to_string)
    }

    pub fn opt_text(&self, name: &str) -> Option<String> {
        self.get(name).map(ToString::to_string)
    }

    pub fn int(&self, name: &str) -> Result<i64, InvocationError> {
        match self.require(name)? {
            ParamValue::Int(n) => Ok(*n),
            _ => Err(InvocationError::InvalidParameter {
                name: name.to_string(),
                expected: "an integer",
            }),
        }
    }
}

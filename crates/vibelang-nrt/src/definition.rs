//! Compiled synth definitions as seen by the scheduler.
//!
//! The scheduler never looks inside the compiled bytes. It only needs a name
//! to sort and deduplicate by, and the declared parameters to validate
//! control writes and pick between `/n_set` and inline creation arguments.

use crate::protocol::ParameterRate;

/// A declared synth parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    /// Parameter name as declared in the SynthDef.
    pub name: String,
    /// Default value used when no event has been written.
    pub default: f64,
    /// Rate of the parameter.
    pub rate: ParameterRate,
}

impl ParameterSpec {
    /// Create a control-rate parameter.
    pub fn new(name: impl Into<String>, default: f64) -> Self {
        Self {
            name: name.into(),
            default,
            rate: ParameterRate::Control,
        }
    }

    /// Set the parameter rate.
    pub fn with_rate(mut self, rate: ParameterRate) -> Self {
        self.rate = rate;
        self
    }
}

/// A compiled SynthDef: its name, parameters and `.scsyndef` bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthDefinition {
    /// SynthDef name, also the stable sort key.
    pub name: String,
    /// Declared parameters in declaration order.
    pub parameters: Vec<ParameterSpec>,
    /// Compiled bytes, sent verbatim with `/d_recv`.
    pub bytes: Vec<u8>,
}

impl SynthDefinition {
    /// Create a definition with no parameters.
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            bytes,
        }
    }

    /// Add a parameter.
    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Look up a parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Whether stopping should release via `gate=0` instead of freeing.
    pub fn has_gate(&self) -> bool {
        self.parameter("gate").is_some()
    }

    /// Whether the given parameter is scalar-rate.
    pub fn is_scalar(&self, name: &str) -> bool {
        self.parameter(name)
            .is_some_and(|p| p.rate == ParameterRate::Scalar)
    }
}

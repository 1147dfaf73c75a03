//! Registered operators.
//!
//! Operators are looked up by name and called with their input tensors. The
//! built-in `add_tensors` delegates to
//! [`Dispatcher::dispatch_binary_elementwise`] with the packaged kernel
//! library of the inputs' device.

use std::collections::HashMap;
use std::sync::Arc;

use forge_device::Buffer;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use snafu::{OptionExt, ensure};

use crate::dispatch::{Dispatcher, dispatcher};
use crate::error::{InvalidAritySnafu, Result, UnknownOperatorSnafu};

/// An operator implementation taking its inputs in order.
pub type OperatorFn = Arc<dyn Fn(&[Buffer]) -> Result<Buffer> + Send + Sync>;

pub struct OperatorRegistry {
    operators: RwLock<HashMap<String, OperatorFn>>,
}

impl OperatorRegistry {
    /// Built-in operators backed by the global dispatcher.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register("add_tensors", Arc::new(|inputs: &[Buffer]| {
            let [a, b] = binary_inputs("add_tensors", inputs)?;
            add_tensors(a, b)
        }));
        registry
    }

    /// Built-in operators backed by `dispatcher`.
    pub fn with_dispatcher(dispatcher: Arc<Dispatcher>) -> Self {
        let registry = Self::empty();
        registry.register("add_tensors", Arc::new(move |inputs: &[Buffer]| {
            let [a, b] = binary_inputs("add_tensors", inputs)?;
            dispatcher.add_tensors(a, b)
        }));
        registry
    }

    pub fn empty() -> Self {
        Self { operators: RwLock::new(HashMap::new()) }
    }

    /// Register `op` under `name`, replacing any existing operator.
    pub fn register(&self, name: &str, op: OperatorFn) {
        tracing::debug!(operator = name, "operator registered");
        self.operators.write().insert(name.to_string(), op);
    }

    pub fn get(&self, name: &str) -> Result<OperatorFn> {
        self.operators.read().get(name).cloned().context(UnknownOperatorSnafu { name })
    }

    /// Call the operator `name` with `inputs`.
    pub fn call(&self, name: &str, inputs: &[Buffer]) -> Result<Buffer> {
        let op = self.get(name)?;
        op(inputs)
    }

    /// Registered operator names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operators.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorRegistry").field("operators", &self.names()).finish()
    }
}

fn binary_inputs<'a>(operator: &str, inputs: &'a [Buffer]) -> Result<[&'a Buffer; 2]> {
    ensure!(inputs.len() == 2, InvalidAritySnafu { operator, expected: 2usize, actual: inputs.len() });
    Ok([&inputs[0], &inputs[1]])
}

/// Global operator registry.
pub static OPERATORS: Lazy<OperatorRegistry> = Lazy::new(OperatorRegistry::new);

/// Elementwise sum of two tensors on the same device, using the packaged
/// kernel library. The result is ready once the device's stream reaches it.
pub fn add_tensors(a: &Buffer, b: &Buffer) -> Result<Buffer> {
    dispatcher()?.add_tensors(a, b)
}

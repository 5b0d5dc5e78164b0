//! Operation registry: maps an operation name to the handler that runs it.
//!
//! The registry is assembled once at startup through [`RegistryBuilder`] and
//! is immutable afterwards, so lookups need no synchronization. Adding an
//! operation means implementing [`Operation`] and registering it; the store
//! and claim coordinator never look inside a handler.
//!
//! # Handler contract
//!
//! - [`Operation::validate`] runs before [`Operation::execute`] and defaults
//!   to accepting any arguments.
//! - Both return [`FleetError::Validation`] or [`FleetError::Execution`]
//!   instead of panicking, so a bad job only ever fails itself.

pub mod arithmetic;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{FleetError, Result};

pub use arithmetic::{Divide, Multiply, Subtract, Sum};

pub trait Operation: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn validate(&self, _args: &[i64]) -> Result<()> {
        Ok(())
    }

    fn execute(&self, args: &[i64]) -> Result<i64>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationInfo {
    pub name: String,
    pub description: String,
}

#[derive(Default)]
pub struct RegistryBuilder {
    operations: Vec<Arc<dyn Operation>>,
}

impl RegistryBuilder {
    pub fn register<O: Operation + 'static>(mut self, operation: O) -> Self {
        self.operations.push(Arc::new(operation));
        self
    }

    /// Fails on duplicate names rather than letting the last one win.
    pub fn build(self) -> Result<OperationRegistry> {
        let mut index = HashMap::with_capacity(self.operations.len());
        for (slot, operation) in self.operations.iter().enumerate() {
            if index.insert(operation.name().to_string(), slot).is_some() {
                return Err(FleetError::DuplicateOperation(operation.name().to_string()));
            }
        }
        Ok(OperationRegistry {
            operations: self.operations,
            index,
        })
    }
}

/// Read-only name → handler map, in registration order.
pub struct OperationRegistry {
    operations: Vec<Arc<dyn Operation>>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field(
                "operations",
                &self.operations.iter().map(|o| o.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl OperationRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The four arithmetic operations.
    pub fn with_defaults() -> Self {
        Self {
            operations: vec![
                Arc::new(Sum),
                Arc::new(Subtract),
                Arc::new(Multiply),
                Arc::new(Divide),
            ],
            index: [Sum.name(), Subtract.name(), Multiply.name(), Divide.name()]
                .into_iter()
                .enumerate()
                .map(|(slot, name)| (name.to_string(), slot))
                .collect(),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<&dyn Operation> {
        self.index
            .get(name)
            .map(|&slot| self.operations[slot].as_ref())
            .ok_or_else(|| FleetError::UnknownOperation(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn list(&self) -> Vec<OperationInfo> {
        self.operations
            .iter()
            .map(|o| OperationInfo {
                name: o.name().to_string(),
                description: o.description().to_string(),
            })
            .collect()
    }

    /// Resolve, validate, then execute.
    pub fn execute(&self, name: &str, args: &[i64]) -> Result<i64> {
        let operation = self.resolve(name)?;
        operation.validate(args)?;
        operation.execute(args)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

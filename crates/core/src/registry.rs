use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::domain::execution::ExecutionResult;
use crate::domain::tenant::OperationKind;
use crate::errors::{ApplicationError, DomainError};
use crate::execution_engine::{ExecutionEngine, Operation};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown operation `{0}`")]
    UnknownOperation(String),
    #[error("invalid input for `{operation}`: {message}")]
    InvalidInput { operation: OperationKind, message: String },
}

impl From<RegistryError> for ApplicationError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::UnknownOperation(name) => DomainError::UnknownOperation(name).into(),
            RegistryError::InvalidInput { .. } => {
                DomainError::InvalidInput(value.to_string()).into()
            }
        }
    }
}

/// Object-safe view of an [`Operation`] speaking JSON on both sides.
#[async_trait]
pub trait DynOperation: Send + Sync {
    fn kind(&self) -> OperationKind;
    fn version(&self) -> &str;
    async fn execute_json(
        &self,
        engine: &ExecutionEngine,
        input: Value,
        actor_id: &str,
    ) -> Result<ExecutionResult<Value>, RegistryError>;
}

struct JsonOperation<Op>(Op);

#[async_trait]
impl<Op> DynOperation for JsonOperation<Op>
where
    Op: Operation,
    Op::Input: DeserializeOwned,
{
    fn kind(&self) -> OperationKind {
        self.0.kind()
    }

    fn version(&self) -> &str {
        self.0.version()
    }

    async fn execute_json(
        &self,
        engine: &ExecutionEngine,
        input: Value,
        actor_id: &str,
    ) -> Result<ExecutionResult<Value>, RegistryError> {
        let operation = self.0.kind();
        let input: Op::Input = serde_json::from_value(input).map_err(|error| {
            RegistryError::InvalidInput { operation, message: error.to_string() }
        })?;
        Ok(engine.execute_encoded(&self.0, input, actor_id).await)
    }
}

/// Operations reachable by name from outer surfaces.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: BTreeMap<OperationKind, Arc<dyn DynOperation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any operation previously registered for the same kind.
    pub fn register<Op>(&mut self, operation: Op) -> &mut Self
    where
        Op: Operation + 'static,
        Op::Input: DeserializeOwned,
    {
        let operation: Arc<dyn DynOperation> = Arc::new(JsonOperation(operation));
        self.operations.insert(operation.kind(), operation);
        self
    }

    pub fn get(&self, kind: OperationKind) -> Option<&Arc<dyn DynOperation>> {
        self.operations.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = OperationKind> + '_ {
        self.operations.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Looks `name` up (snake or kebab case) and runs it under the current tenant context.
    pub async fn execute_json(
        &self,
        engine: &ExecutionEngine,
        name: &str,
        input: Value,
        actor_id: &str,
    ) -> Result<ExecutionResult<Value>, RegistryError> {
        let operation = OperationKind::parse(name)
            .and_then(|kind| self.get(kind))
            .ok_or_else(|| RegistryError::UnknownOperation(name.to_owned()))?;
        operation.execute_json(engine, input, actor_id).await
    }
}

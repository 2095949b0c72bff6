use crate::error::{EngineError, EngineResult};
use crate::store::{EngineStore, ExpressionEvaluator};
use crate::types::*;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Evaluation context shared by every operation in one batch.
/// Operations run in list order and read each other's results here.
#[derive(Clone, Debug)]
pub struct ExpressionContext {
    pub container: ContainerRef,
    pub values: BTreeMap<String, Value>,
}

impl ExpressionContext {
    pub fn new(container: ContainerRef) -> Self {
        Self {
            container,
            values: BTreeMap::new(),
        }
    }

    /// Insert unless a value under that name is already present
    /// (first writer wins).
    pub fn seed(&mut self, name: &str, value: Value) {
        self.values.entry(name.to_string()).or_insert(value);
    }
}

/// Pluggable access to one left-operand family (DATA, BUSINESS_DATA,
/// STRING_INDEX). Exactly one update or delete per distinct operand
/// reaches these per batch.
#[async_trait]
pub trait LeftOperandHandler: Send + Sync {
    fn operand_type(&self) -> LeftOperandType;

    async fn retrieve(&self, operand: &LeftOperand, container: ContainerRef)
        -> EngineResult<Option<Value>>;

    async fn update(&self, operand: &LeftOperand, container: ContainerRef, value: Value)
        -> EngineResult<()>;

    async fn delete(&self, operand: &LeftOperand, container: ContainerRef) -> EngineResult<()>;
}

/// Store-backed process/flow-node data variables.
pub struct DataLeftOperandHandler {
    store: Arc<dyn EngineStore>,
}

impl DataLeftOperandHandler {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LeftOperandHandler for DataLeftOperandHandler {
    fn operand_type(&self) -> LeftOperandType {
        LeftOperandType::Data
    }

    async fn retrieve(&self, operand: &LeftOperand, container: ContainerRef)
        -> EngineResult<Option<Value>> {
        self.store.load_data_value(container, &operand.name).await
    }

    async fn update(&self, operand: &LeftOperand, container: ContainerRef, value: Value)
        -> EngineResult<()> {
        self.store.save_data_value(container, &operand.name, value).await
    }

    async fn delete(&self, operand: &LeftOperand, container: ContainerRef) -> EngineResult<()> {
        self.store.delete_data_value(container, &operand.name).await
    }
}

/// Writes the numbered label slots of a process instance. Operand name
/// is the slot number, "1" through "5".
pub struct StringIndexLeftOperandHandler {
    store: Arc<dyn EngineStore>,
}

impl StringIndexLeftOperandHandler {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    fn slot(operand: &LeftOperand) -> EngineResult<usize> {
        operand
            .name
            .parse::<usize>()
            .ok()
            .filter(|n| (1..=STRING_INDEX_SLOTS).contains(n))
            .map(|n| n - 1)
            .ok_or_else(|| {
                EngineError::OperationExecution(format!(
                    "invalid string index slot '{}', expected 1..={STRING_INDEX_SLOTS}",
                    operand.name
                ))
            })
    }

    fn instance_id(container: ContainerRef) -> EngineResult<uuid::Uuid> {
        if container.container_type != ContainerType::ProcessInstance {
            return Err(EngineError::OperationExecution(
                "string index operations target a process instance".into(),
            ));
        }
        Ok(container.id)
    }
}

#[async_trait]
impl LeftOperandHandler for StringIndexLeftOperandHandler {
    fn operand_type(&self) -> LeftOperandType {
        LeftOperandType::StringIndex
    }

    async fn retrieve(&self, operand: &LeftOperand, container: ContainerRef)
        -> EngineResult<Option<Value>> {
        let id = Self::instance_id(container)?;
        let slot = Self::slot(operand)?;
        let instance = self
            .store
            .load_process_instance(id)
            .await?
            .ok_or(EngineError::ProcessInstanceNotFound(id))?;
        Ok(instance.string_indexes[slot].clone().map(Value::String))
    }

    async fn update(&self, operand: &LeftOperand, container: ContainerRef, value: Value)
        -> EngineResult<()> {
        let id = Self::instance_id(container)?;
        let slot = Self::slot(operand)?;
        let text = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        self.store.set_string_index(id, slot, Some(text)).await
    }

    async fn delete(&self, operand: &LeftOperand, container: ContainerRef) -> EngineResult<()> {
        let id = Self::instance_id(container)?;
        let slot = Self::slot(operand)?;
        self.store.set_string_index(id, slot, None).await
    }
}

enum Disposition {
    Update(Value),
    Delete,
}

/// Applies a batch of operations atomically against one container.
///
/// Three phases: pre-retrieve current values for mutating operators,
/// compute every operation in list order against the shared context,
/// then persist exactly one update or delete per distinct operand
/// (last write wins).
pub struct OperationExecutor {
    handlers: HashMap<LeftOperandType, Arc<dyn LeftOperandHandler>>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl OperationExecutor {
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self {
            handlers: HashMap::new(),
            evaluator,
        }
    }

    /// Executor with the built-in DATA and STRING_INDEX handlers.
    pub fn standard(store: Arc<dyn EngineStore>, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        let mut executor = Self::new(evaluator);
        executor.register_handler(Arc::new(DataLeftOperandHandler::new(store.clone())));
        executor.register_handler(Arc::new(StringIndexLeftOperandHandler::new(store)));
        executor
    }

    pub fn register_handler(&mut self, handler: Arc<dyn LeftOperandHandler>) {
        self.handlers.insert(handler.operand_type(), handler);
    }

    fn handler(&self, operand_type: LeftOperandType)
        -> EngineResult<&Arc<dyn LeftOperandHandler>> {
        // A missing handler is a configuration error, never retryable.
        self.handlers.get(&operand_type).ok_or_else(|| {
            EngineError::OperationExecution(format!(
                "no left operand handler registered for {operand_type:?}"
            ))
        })
    }

    pub async fn execute(
        &self,
        operations: &[Operation],
        context: &mut ExpressionContext,
    ) -> EngineResult<()> {
        self.pre_retrieve(operations, context).await?;

        let mut order: Vec<LeftOperand> = Vec::new();
        let mut dispositions: HashMap<LeftOperand, Disposition> = HashMap::new();

        for op in operations {
            let disposition = self.compute(op, context).await?;
            if !dispositions.contains_key(&op.left) {
                order.push(op.left.clone());
            }
            dispositions.insert(op.left.clone(), disposition);
        }

        for operand in order {
            let Some(disposition) = dispositions.remove(&operand) else {
                continue;
            };
            let handler = self.handler(operand.operand_type)?;
            match disposition {
                Disposition::Update(value) => {
                    handler
                        .update(&operand, context.container, value)
                        .await
                        .map_err(|e| match e {
                            already @ EngineError::OperationExecution(_) => already,
                            cause => EngineError::OperationExecution(format!(
                                "updating '{}': {cause}",
                                operand.name
                            )),
                        })?;
                    tracing::debug!(operand = %operand.name, "operation target updated");
                }
                Disposition::Delete => {
                    handler.delete(&operand, context.container).await?;
                    tracing::debug!(operand = %operand.name, "operation target deleted");
                }
            }
        }
        Ok(())
    }

    async fn pre_retrieve(
        &self,
        operations: &[Operation],
        context: &mut ExpressionContext,
    ) -> EngineResult<()> {
        for op in operations {
            if !op.operator.requires_current_value()
                || context.values.contains_key(&op.left.name)
            {
                continue;
            }
            let handler = self.handler(op.left.operand_type)?;
            if let Some(current) = handler.retrieve(&op.left, context.container).await? {
                context.seed(&op.left.name, current);
            }
        }
        Ok(())
    }

    async fn compute(
        &self,
        op: &Operation,
        context: &mut ExpressionContext,
    ) -> EngineResult<Disposition> {
        if op.operator == OperatorType::Deletion {
            context.values.remove(&op.left.name);
            return Ok(Disposition::Delete);
        }

        let expression = op.expression.as_ref().ok_or_else(|| {
            EngineError::OperationExecution(format!(
                "operation on '{}' has no right operand expression",
                op.left.name
            ))
        })?;
        let rhs = self
            .evaluator
            .evaluate(expression, context)
            .await
            .map_err(|e| {
                EngineError::OperationExecution(format!(
                    "evaluating right operand for '{}': {e}",
                    op.left.name
                ))
            })?;

        let new_value = match op.operator {
            OperatorType::Assignment => rhs,
            OperatorType::FieldUpdate => {
                let field = op.operator_input.clone().ok_or_else(|| {
                    EngineError::OperationExecution(format!(
                        "field update on '{}' is missing the field name",
                        op.left.name
                    ))
                })?;
                let mut current = context
                    .values
                    .get(&op.left.name)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                match current {
                    Value::Object(ref mut map) => {
                        map.insert(field, rhs);
                    }
                    _ => {
                        return Err(EngineError::OperationExecution(format!(
                            "field update on '{}' requires an object value",
                            op.left.name
                        )))
                    }
                }
                current
            }
            OperatorType::PathUpdate => {
                let pointer = op.operator_input.clone().ok_or_else(|| {
                    EngineError::OperationExecution(format!(
                        "path update on '{}' is missing the target path",
                        op.left.name
                    ))
                })?;
                let mut current =
                    context.values.get(&op.left.name).cloned().ok_or_else(|| {
                        EngineError::OperationExecution(format!(
                            "path update on '{}' found no current value",
                            op.left.name
                        ))
                    })?;
                match current.pointer_mut(&pointer) {
                    Some(slot) => *slot = rhs,
                    None => {
                        return Err(EngineError::OperationExecution(format!(
                            "path '{pointer}' not found in '{}'",
                            op.left.name
                        )))
                    }
                }
                current
            }
            OperatorType::Deletion => unreachable!("handled above"),
        };

        context
            .values
            .insert(op.left.name.clone(), new_value.clone());
        Ok(Disposition::Update(new_value))
    }
}

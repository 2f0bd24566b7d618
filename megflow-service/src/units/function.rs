// In-process routines
// Closures wrapped as units of work

use super::{InvocationContext, Routine, RoutineError, RoutineOutputs, SlotSpec};

use std::fmt;
use std::sync::Arc;

type RoutineFn = dyn Fn(&InvocationContext) -> Result<RoutineOutputs, RoutineError> + Send + Sync;

/// Routine backed by a synchronous closure
///
/// The closure runs on the worker task, so it should only do short
/// filesystem work; anything long-running belongs in an external command.
#[derive(Clone)]
pub struct FnRoutine {
    name: String,
    inputs: Vec<SlotSpec>,
    outputs: Vec<SlotSpec>,
    func: Arc<RoutineFn>,
}

impl FnRoutine {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&InvocationContext) -> Result<RoutineOutputs, RoutineError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            func: Arc::new(func),
        }
    }

    /// Declare an input slot
    pub fn input(mut self, spec: SlotSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    /// Declare an output slot
    pub fn output(mut self, spec: SlotSpec) -> Self {
        self.outputs.push(spec);
        self
    }
}

impl fmt::Debug for FnRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnRoutine")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Routine for FnRoutine {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        self.inputs.clone()
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        self.outputs.clone()
    }

    async fn invoke(&self, invocation: &InvocationContext) -> Result<RoutineOutputs, RoutineError> {
        (self.func)(invocation)
    }
}

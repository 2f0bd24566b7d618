// Iteration Expansion
// Instantiates a workflow template once per combination of axis values

use super::context::{ExecutionContext, IterationAxis};
use super::graph::{DependencyGraph, GraphError, GraphErrorKind, InputBinding};
use super::report::NodeStatus;
use crate::units::{BoundInputs, NodeInstanceId, SlotValue};

use std::collections::HashMap;
use std::sync::Arc;

/// A unit of work bound to one execution context
#[derive(Debug, Clone)]
pub struct NodeInstance {
    pub id: NodeInstanceId,
    /// Index of the unit in the shared template
    pub unit_index: usize,
    pub status: NodeStatus,
    /// Literal and axis bindings resolved for this context
    pub bound: BoundInputs,
}

/// One instantiation of a workflow template
#[derive(Debug, Clone)]
pub struct GraphInstance {
    pub context: ExecutionContext,
    pub graph: Arc<DependencyGraph>,
    pub nodes: Vec<NodeInstance>,
}

impl GraphInstance {
    pub fn node(&self, unit: &str) -> Option<&NodeInstance> {
        self.nodes.iter().find(|node| node.id.unit == unit)
    }
}

/// Cartesian expansion of iteration axes over a workflow template
pub struct IterationExpander;

impl IterationExpander {
    /// Expand the template into one graph instance per context
    ///
    /// An axis without values, or no axes at all, yields no instances.
    pub fn expand(
        axes: &[IterationAxis],
        graph: Arc<DependencyGraph>,
    ) -> Result<Vec<GraphInstance>, GraphError> {
        graph.validate()?;
        Self::check_axis_bindings(axes, &graph)?;

        Self::contexts(axes)?
            .into_iter()
            .map(|context| Self::instantiate(&graph, context))
            .collect()
    }

    /// Every combination of axis values, first axis outermost
    pub fn contexts(axes: &[IterationAxis]) -> Result<Vec<ExecutionContext>, GraphError> {
        for axis in axes {
            if let Some(value) = axis.first_duplicate() {
                return Err(GraphError::new(
                    GraphErrorKind::DuplicateAxisValue,
                    format!("value '{}' appears more than once on axis '{}'", value, axis.name),
                ));
            }
        }

        if axes.is_empty() || axes.iter().any(IterationAxis::is_empty) {
            return Ok(Vec::new());
        }

        let mut combinations: Vec<Vec<(String, String)>> = vec![Vec::new()];
        for axis in axes {
            combinations = combinations
                .into_iter()
                .flat_map(|prefix| {
                    axis.values.iter().map(move |value| {
                        let mut bindings = prefix.clone();
                        bindings.push((axis.name.clone(), value.clone()));
                        bindings
                    })
                })
                .collect();
        }

        let contexts: Vec<ExecutionContext> =
            combinations.into_iter().map(ExecutionContext::new).collect();

        // Keys name the per-instance directories, so they must stay distinct
        let mut seen: HashMap<String, &ExecutionContext> = HashMap::new();
        for context in &contexts {
            if let Some(other) = seen.insert(context.key(), context) {
                return Err(GraphError::new(
                    GraphErrorKind::ContextKeyCollision,
                    format!(
                        "contexts '{}' and '{}' share the directory key '{}'",
                        other,
                        context,
                        context.key()
                    ),
                ));
            }
        }

        Ok(contexts)
    }

    fn check_axis_bindings(
        axes: &[IterationAxis],
        graph: &DependencyGraph,
    ) -> Result<(), GraphError> {
        for unit in graph.units() {
            for input in unit.inputs() {
                if let Some(InputBinding::Axis(axis)) = &input.binding {
                    if !axes.iter().any(|a| &a.name == axis) {
                        return Err(GraphError::new(
                            GraphErrorKind::UnboundInput,
                            format!(
                                "input '{}.{}' is bound to axis '{}', which is not iterated",
                                unit.id(),
                                input.spec.name,
                                axis
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn instantiate(
        graph: &Arc<DependencyGraph>,
        context: ExecutionContext,
    ) -> Result<GraphInstance, GraphError> {
        let context_key = context.key();
        let nodes = graph
            .units()
            .iter()
            .enumerate()
            .map(|(unit_index, unit)| {
                let mut bound = BoundInputs::new();
                for input in unit.inputs() {
                    match &input.binding {
                        Some(InputBinding::Literal(value)) => {
                            bound.insert(input.spec.name.clone(), value.clone())
                        }
                        Some(InputBinding::Axis(axis)) => {
                            let value = context.get(axis).ok_or_else(|| {
                                GraphError::new(
                                    GraphErrorKind::UnboundInput,
                                    format!("context {} has no axis '{}'", context, axis),
                                )
                            })?;
                            bound.insert(input.spec.name.clone(), SlotValue::scalar(value))
                        }
                        Some(InputBinding::Upstream { .. }) | None => {}
                    }
                }
                Ok::<_, GraphError>(NodeInstance {
                    id: NodeInstanceId::new(unit.id(), context_key.clone()),
                    unit_index,
                    status: NodeStatus::Pending,
                    bound,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GraphInstance {
            context,
            graph: Arc::clone(graph),
            nodes,
        })
    }
}

/// Builder for iteration axes
#[derive(Debug, Default)]
pub struct IterationBuilder {
    axes: Vec<IterationAxis>,
}

impl IterationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an axis; axes are expanded in the order they are added
    pub fn axis<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.axes.push(IterationAxis::new(name, values));
        self
    }

    pub fn build(self) -> Vec<IterationAxis> {
        self.axes
    }
}

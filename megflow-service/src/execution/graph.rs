// Dependency Graph (DAG)
// Units of work connected by slot-level data dependencies

use crate::units::{Routine, SlotKind, SlotSpec, SlotValue};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Error type for graph operations
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    Cycle,
    /// Required input slot with no binding
    UnboundInput,
    /// Reference to a unit that does not exist
    UnknownUnit,
    /// Reference to a slot the unit does not declare
    UnknownSlot,
    /// Two units with the same id
    DuplicateUnit,
    /// Second binding into an input slot
    SlotAlreadyBound,
    /// Binding of a different kind than the slot declares
    IncompatibleSlot,
    /// Repeated value on an iteration axis
    DuplicateAxisValue,
    /// Distinct contexts that map to the same on-disk key
    ContextKeyCollision,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn new(kind: GraphErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    pub fn cyclic(cycle: &[&str]) -> Self {
        Self::new(
            GraphErrorKind::Cycle,
            format!("circular dependency detected: {}", cycle.join(" -> ")),
        )
    }

    pub fn unknown_unit(unit: &str) -> Self {
        Self::new(
            GraphErrorKind::UnknownUnit,
            format!("unknown unit '{}'", unit),
        )
    }

    pub fn unknown_slot(unit: &str, slot: &str, direction: &str) -> Self {
        Self::new(
            GraphErrorKind::UnknownSlot,
            format!("unit '{}' has no {} slot '{}'", unit, direction, slot),
        )
    }

    pub fn unbound_input(unit: &str, slot: &str) -> Self {
        Self::new(
            GraphErrorKind::UnboundInput,
            format!("required input '{}.{}' is not bound", unit, slot),
        )
    }
}

/// Where an input slot gets its value from
#[derive(Debug, Clone, PartialEq)]
pub enum InputBinding {
    /// Fixed value for every instance
    Literal(SlotValue),
    /// Output of another unit in the same instance
    Upstream { unit: String, slot: String },
    /// Value of an iteration axis for the instance's context
    Axis(String),
}

/// Declared input slot with its binding
#[derive(Debug, Clone)]
pub struct InputSlot {
    pub spec: SlotSpec,
    pub binding: Option<InputBinding>,
}

/// A node template: an id, typed slots and the routine that runs it
#[derive(Clone)]
pub struct UnitOfWork {
    id: String,
    inputs: Vec<InputSlot>,
    outputs: Vec<SlotSpec>,
    routine: Arc<dyn Routine>,
    published: bool,
}

impl UnitOfWork {
    /// Create a unit whose slots are those declared by the routine
    pub fn new(id: impl Into<String>, routine: impl Routine + 'static) -> Self {
        Self::from_arc(id, Arc::new(routine))
    }

    pub fn from_arc(id: impl Into<String>, routine: Arc<dyn Routine>) -> Self {
        let inputs = routine
            .inputs()
            .into_iter()
            .map(|spec| InputSlot {
                spec,
                binding: None,
            })
            .collect();
        let outputs = routine.outputs();
        Self {
            id: id.into(),
            inputs,
            outputs,
            routine,
            published: false,
        }
    }

    /// Copy this unit's file outputs into the artifact tree on completion
    pub fn published(mut self) -> Self {
        self.published = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[SlotSpec] {
        &self.outputs
    }

    pub fn routine(&self) -> &Arc<dyn Routine> {
        &self.routine
    }

    pub fn is_published(&self) -> bool {
        self.published
    }

    pub fn input(&self, slot: &str) -> Option<&InputSlot> {
        self.inputs.iter().find(|input| input.spec.name == slot)
    }

    pub fn output(&self, slot: &str) -> Option<&SlotSpec> {
        self.outputs.iter().find(|output| output.name == slot)
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("routine", &self.routine.name())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("published", &self.published)
            .finish()
    }
}

/// Data dependency from an output slot to an input slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub src_unit: String,
    pub src_slot: String,
    pub dst_unit: String,
    pub dst_slot: String,
}

/// Workflow template: units and the edges between them
///
/// Built once, validated, then shared read-only by every graph instance.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    name: String,
    units: Vec<UnitOfWork>,
    unit_indices: HashMap<String, usize>,
    edges: Vec<Edge>,
}

impl DependencyGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn units(&self) -> &[UnitOfWork] {
        &self.units
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Get a unit by id
    pub fn get_unit(&self, id: &str) -> Option<&UnitOfWork> {
        self.unit_indices.get(id).map(|&idx| &self.units[idx])
    }

    pub fn unit_index(&self, id: &str) -> Option<usize> {
        self.unit_indices.get(id).copied()
    }

    /// Add a unit; ids must be unique
    pub fn add_unit(&mut self, unit: UnitOfWork) -> Result<(), GraphError> {
        if self.unit_indices.contains_key(unit.id()) {
            return Err(GraphError::new(
                GraphErrorKind::DuplicateUnit,
                format!("unit '{}' is already defined", unit.id()),
            ));
        }
        self.unit_indices.insert(unit.id().to_string(), self.units.len());
        self.units.push(unit);
        Ok(())
    }

    /// Feed `src.src_slot` into `dst.dst_slot`
    pub fn connect(
        &mut self,
        src: &str,
        src_slot: &str,
        dst: &str,
        dst_slot: &str,
    ) -> Result<(), GraphError> {
        let source = self
            .get_unit(src)
            .ok_or_else(|| GraphError::unknown_unit(src))?;
        let output_kind = source
            .output(src_slot)
            .ok_or_else(|| GraphError::unknown_slot(src, src_slot, "output"))?
            .kind;

        let expected = self.bindable_input(dst, dst_slot)?;
        if expected != output_kind {
            return Err(GraphError::new(
                GraphErrorKind::IncompatibleSlot,
                format!(
                    "cannot connect {} output '{}.{}' to {} input '{}.{}'",
                    output_kind, src, src_slot, expected, dst, dst_slot
                ),
            ));
        }

        self.set_binding(
            dst,
            dst_slot,
            InputBinding::Upstream {
                unit: src.to_string(),
                slot: src_slot.to_string(),
            },
        );
        self.edges.push(Edge {
            src_unit: src.to_string(),
            src_slot: src_slot.to_string(),
            dst_unit: dst.to_string(),
            dst_slot: dst_slot.to_string(),
        });
        Ok(())
    }

    /// Bind a fixed value to an input slot
    pub fn bind_literal(
        &mut self,
        unit: &str,
        slot: &str,
        value: impl Into<SlotValue>,
    ) -> Result<(), GraphError> {
        let value = value.into();
        let expected = self.bindable_input(unit, slot)?;
        if value.kind() != expected {
            return Err(GraphError::new(
                GraphErrorKind::IncompatibleSlot,
                format!(
                    "literal for '{}.{}' is a {}, slot expects a {}",
                    unit,
                    slot,
                    value.kind(),
                    expected
                ),
            ));
        }
        self.set_binding(unit, slot, InputBinding::Literal(value));
        Ok(())
    }

    /// Bind an input slot to the value of an iteration axis
    pub fn bind_axis(&mut self, unit: &str, slot: &str, axis: &str) -> Result<(), GraphError> {
        let expected = self.bindable_input(unit, slot)?;
        if expected != SlotKind::Scalar {
            return Err(GraphError::new(
                GraphErrorKind::IncompatibleSlot,
                format!(
                    "axis '{}' yields a scalar, '{}.{}' expects a {}",
                    axis, unit, slot, expected
                ),
            ));
        }
        self.set_binding(unit, slot, InputBinding::Axis(axis.to_string()));
        Ok(())
    }

    /// Check the input exists and is unbound; returns its kind
    fn bindable_input(&self, unit: &str, slot: &str) -> Result<SlotKind, GraphError> {
        let target = self
            .get_unit(unit)
            .ok_or_else(|| GraphError::unknown_unit(unit))?;
        let input = target
            .input(slot)
            .ok_or_else(|| GraphError::unknown_slot(unit, slot, "input"))?;
        if input.binding.is_some() {
            return Err(GraphError::new(
                GraphErrorKind::SlotAlreadyBound,
                format!("input '{}.{}' already has a binding", unit, slot),
            ));
        }
        Ok(input.spec.kind)
    }

    fn set_binding(&mut self, unit: &str, slot: &str, binding: InputBinding) {
        let Some(idx) = self.unit_index(unit) else {
            return;
        };
        if let Some(input) = self.units[idx]
            .inputs
            .iter_mut()
            .find(|input| input.spec.name == slot)
        {
            input.binding = Some(binding);
        }
    }

    /// Distinct upstream unit indices for every unit, in edge order
    pub fn upstream_indices(&self) -> Vec<Vec<usize>> {
        let mut upstream = vec![Vec::new(); self.units.len()];
        for edge in &self.edges {
            if let (Some(src), Some(dst)) = (self.unit_index(&edge.src_unit), self.unit_index(&edge.dst_unit)) {
                if !upstream[dst].contains(&src) {
                    upstream[dst].push(src);
                }
            }
        }
        upstream
    }

    /// Distinct downstream unit indices for every unit, in edge order
    pub fn downstream_indices(&self) -> Vec<Vec<usize>> {
        let mut downstream = vec![Vec::new(); self.units.len()];
        for (dst, sources) in self.upstream_indices().into_iter().enumerate() {
            for src in sources {
                downstream[src].push(dst);
            }
        }
        downstream
    }

    /// Units whose outputs feed `unit`
    pub fn upstream(&self, unit: &str) -> Vec<&str> {
        let Some(idx) = self.unit_index(unit) else {
            return Vec::new();
        };
        self.upstream_indices()[idx]
            .iter()
            .map(|&i| self.units[i].id())
            .collect()
    }

    /// Units consuming outputs of `unit`
    pub fn downstream(&self, unit: &str) -> Vec<&str> {
        let Some(idx) = self.unit_index(unit) else {
            return Vec::new();
        };
        self.downstream_indices()[idx]
            .iter()
            .map(|&i| self.units[i].id())
            .collect()
    }

    /// Validate the graph: acyclic and every required input bound
    pub fn validate(&self) -> Result<(), GraphError> {
        self.topological_indices()?;

        for unit in &self.units {
            for input in &unit.inputs {
                if input.spec.required && input.binding.is_none() {
                    return Err(GraphError::unbound_input(unit.id(), &input.spec.name));
                }
            }
        }

        Ok(())
    }

    /// Units in topological order (Kahn's algorithm, ties in declaration order)
    pub fn topological_order(&self) -> Result<Vec<&UnitOfWork>, GraphError> {
        Ok(self
            .topological_indices()?
            .into_iter()
            .map(|idx| &self.units[idx])
            .collect())
    }

    fn topological_indices(&self) -> Result<Vec<usize>, GraphError> {
        let upstream = self.upstream_indices();
        let downstream = self.downstream_indices();
        let mut in_degree: Vec<usize> = upstream.iter().map(Vec::len).collect();

        let mut queue: VecDeque<usize> = (0..self.units.len())
            .filter(|&idx| in_degree[idx] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.units.len());

        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            for &next in &downstream[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() < self.units.len() {
            let cycle = self.find_cycle(&upstream, &in_degree);
            return Err(GraphError::cyclic(&cycle));
        }

        Ok(order)
    }

    /// Concrete cycle among the units Kahn's algorithm could not order
    fn find_cycle(&self, upstream: &[Vec<usize>], in_degree: &[usize]) -> Vec<&str> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for start in (0..self.units.len()).filter(|&idx| in_degree[idx] > 0) {
            if let Some(cycle) = self.dfs_cycle(start, upstream, &mut visited, &mut stack) {
                return cycle;
            }
        }
        Vec::new()
    }

    fn dfs_cycle(
        &self,
        node: usize,
        upstream: &[Vec<usize>],
        visited: &mut HashSet<usize>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<&str>> {
        if let Some(pos) = stack.iter().position(|&n| n == node) {
            // Dependencies were followed backwards; print them in data-flow order
            let mut cycle: Vec<&str> = stack[pos..]
                .iter()
                .rev()
                .map(|&idx| self.units[idx].id())
                .collect();
            if let Some(&first) = cycle.first() {
                cycle.push(first);
            }
            return Some(cycle);
        }
        if !visited.insert(node) {
            return None;
        }

        stack.push(node);
        for &dep in &upstream[node] {
            if let Some(cycle) = self.dfs_cycle(dep, upstream, visited, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        None
    }

    /// Units grouped into levels that can run in parallel
    pub fn parallel_levels(&self) -> Result<Vec<Vec<&UnitOfWork>>, GraphError> {
        let upstream = self.upstream_indices();
        let mut levels: Vec<Vec<&UnitOfWork>> = Vec::new();
        let mut assigned: HashMap<usize, usize> = HashMap::new();

        for idx in self.topological_indices()? {
            let level = upstream[idx]
                .iter()
                .filter_map(|dep| assigned.get(dep))
                .max()
                .map(|l| l + 1)
                .unwrap_or(0);

            assigned.insert(idx, level);

            if level >= levels.len() {
                levels.resize(level + 1, Vec::new());
            }
            levels[level].push(&self.units[idx]);
        }

        Ok(levels)
    }

    /// Render as a Graphviz digraph, edges labelled with slot names
    pub fn to_dot(&self) -> String {
        let mut dot = format!("digraph \"{}\" {{\n", escape_dot(&self.name));
        dot.push_str("    rankdir=TB;\n    node [shape=box, style=rounded];\n");

        for unit in &self.units {
            let style = if unit.is_published() {
                ", style=\"rounded,filled\", fillcolor=lightblue"
            } else {
                ""
            };
            dot.push_str(&format!(
                "    \"{}\" [label=\"{}\\n({})\"{}];\n",
                escape_dot(unit.id()),
                escape_dot(unit.id()),
                escape_dot(unit.routine().name()),
                style
            ));
        }

        for edge in &self.edges {
            dot.push_str(&format!(
                "    \"{}\" -> \"{}\" [label=\"{} -> {}\"];\n",
                escape_dot(&edge.src_unit),
                escape_dot(&edge.dst_unit),
                escape_dot(&edge.src_slot),
                escape_dot(&edge.dst_slot)
            ));
        }

        dot.push_str("}\n");
        dot
    }
}

fn escape_dot(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{FnRoutine, RoutineOutputs};

    use std::path::PathBuf;

    fn passthrough(name: &str) -> FnRoutine {
        FnRoutine::new(name, |_| Ok(RoutineOutputs::new()))
            .input(SlotSpec::path("in"))
            .output(SlotSpec::path("out"))
    }

    fn source(name: &str) -> FnRoutine {
        FnRoutine::new(name, |_| Ok(RoutineOutputs::new())).output(SlotSpec::path("out"))
    }

    fn linear_graph() -> DependencyGraph {
        let mut graph = DependencyGraph::new("linear");
        graph.add_unit(UnitOfWork::new("grab", source("grab"))).unwrap();
        graph.add_unit(UnitOfWork::new("recon", passthrough("recon"))).unwrap();
        graph.add_unit(UnitOfWork::new("bem", passthrough("bem"))).unwrap();
        graph.connect("grab", "out", "recon", "in").unwrap();
        graph.connect("recon", "out", "bem", "in").unwrap();
        graph
    }

    #[test]
    fn test_linear_order() {
        let graph = linear_graph();
        graph.validate().unwrap();

        let order: Vec<_> = graph
            .topological_order()
            .unwrap()
            .iter()
            .map(|u| u.id())
            .collect();
        assert_eq!(order, vec!["grab", "recon", "bem"]);
        assert_eq!(graph.upstream("recon"), vec!["grab"]);
        assert_eq!(graph.downstream("recon"), vec!["bem"]);
    }

    #[test]
    fn test_mutual_dependency_is_cycle() {
        let mut graph = DependencyGraph::new("cyclic");
        graph.add_unit(UnitOfWork::new("a", passthrough("a"))).unwrap();
        graph.add_unit(UnitOfWork::new("b", passthrough("b"))).unwrap();
        graph.connect("a", "out", "b", "in").unwrap();
        graph.connect("b", "out", "a", "in").unwrap();

        let err = graph.validate().unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::Cycle);
        assert!(err.message.contains("a -> b -> a") || err.message.contains("b -> a -> b"));
    }

    #[test]
    fn test_cycle_reported_behind_a_valid_prefix() {
        let mut graph = DependencyGraph::new("cyclic");
        graph.add_unit(UnitOfWork::new("grab", source("grab"))).unwrap();
        let join = FnRoutine::new("join", |_| Ok(RoutineOutputs::new()))
            .input(SlotSpec::path("a"))
            .input(SlotSpec::path("b"))
            .output(SlotSpec::path("out"));
        graph.add_unit(UnitOfWork::new("x", join)).unwrap();
        graph.add_unit(UnitOfWork::new("y", passthrough("y"))).unwrap();
        graph.connect("grab", "out", "x", "a").unwrap();
        graph.connect("y", "out", "x", "b").unwrap();
        graph.connect("x", "out", "y", "in").unwrap();

        let err = graph.validate().unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::Cycle);
        assert!(!err.message.contains("grab"));
    }

    #[test]
    fn test_duplicate_unit() {
        let mut graph = DependencyGraph::new("dup");
        graph.add_unit(UnitOfWork::new("a", source("a"))).unwrap();
        let err = graph.add_unit(UnitOfWork::new("a", source("a"))).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::DuplicateUnit);
    }

    #[test]
    fn test_unknown_references() {
        let mut graph = linear_graph();
        assert_eq!(
            graph.connect("missing", "out", "bem", "in").unwrap_err().kind,
            GraphErrorKind::UnknownUnit
        );
        assert_eq!(
            graph.connect("grab", "nope", "bem", "in").unwrap_err().kind,
            GraphErrorKind::UnknownSlot
        );
        assert_eq!(
            graph.bind_axis("grab", "subject_id", "subject_id").unwrap_err().kind,
            GraphErrorKind::UnknownSlot
        );
    }

    #[test]
    fn test_fan_in_rejected() {
        let mut graph = linear_graph();
        let err = graph.connect("grab", "out", "bem", "in").unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::SlotAlreadyBound);

        let err = graph
            .bind_literal("recon", "in", PathBuf::from("/t1.nii.gz"))
            .unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::SlotAlreadyBound);
    }

    #[test]
    fn test_incompatible_slots() {
        let mut graph = DependencyGraph::new("kinds");
        let grab = FnRoutine::new("grab", |_| Ok(RoutineOutputs::new())).output(SlotSpec::paths("files"));
        graph.add_unit(UnitOfWork::new("grab", grab)).unwrap();
        graph.add_unit(UnitOfWork::new("recon", passthrough("recon"))).unwrap();

        let err = graph.connect("grab", "files", "recon", "in").unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::IncompatibleSlot);

        let err = graph
            .bind_literal("recon", "in", SlotValue::scalar("sub001"))
            .unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::IncompatibleSlot);

        let err = graph.bind_axis("recon", "in", "subject_id").unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::IncompatibleSlot);
    }

    #[test]
    fn test_unbound_required_input() {
        let mut graph = DependencyGraph::new("unbound");
        graph.add_unit(UnitOfWork::new("recon", passthrough("recon"))).unwrap();

        let err = graph.validate().unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnboundInput);

        graph
            .bind_literal("recon", "in", PathBuf::from("/t1.nii.gz"))
            .unwrap();
        graph.validate().unwrap();
    }

    #[test]
    fn test_optional_input_may_stay_unbound() {
        let mut graph = DependencyGraph::new("optional");
        let routine = FnRoutine::new("opt", |_| Ok(RoutineOutputs::new()))
            .input(SlotSpec::scalar("threads").optional());
        graph.add_unit(UnitOfWork::new("opt", routine)).unwrap();
        graph.validate().unwrap();
    }

    #[test]
    fn test_parallel_levels() {
        let mut graph = DependencyGraph::new("diamond");
        graph.add_unit(UnitOfWork::new("grab", source("grab"))).unwrap();
        graph.add_unit(UnitOfWork::new("left", passthrough("left"))).unwrap();
        graph.add_unit(UnitOfWork::new("right", passthrough("right"))).unwrap();
        let join = FnRoutine::new("join", |_| Ok(RoutineOutputs::new()))
            .input(SlotSpec::path("a"))
            .input(SlotSpec::path("b"));
        graph.add_unit(UnitOfWork::new("join", join)).unwrap();
        graph.connect("grab", "out", "left", "in").unwrap();
        graph.connect("grab", "out", "right", "in").unwrap();
        graph.connect("left", "out", "join", "a").unwrap();
        graph.connect("right", "out", "join", "b").unwrap();

        let levels = graph.parallel_levels().unwrap();
        let names: Vec<Vec<&str>> = levels
            .iter()
            .map(|level| level.iter().map(|u| u.id()).collect())
            .collect();
        assert_eq!(names, vec![vec!["grab"], vec!["left", "right"], vec!["join"]]);
        assert_eq!(graph.upstream("join"), vec!["left", "right"]);
    }

    #[test]
    fn test_to_dot() {
        let dot = linear_graph().to_dot();
        assert!(dot.starts_with("digraph \"linear\" {"));
        assert!(dot.contains("\"grab\" -> \"recon\" [label=\"out -> in\"];"));
        assert!(dot.trim_end().ends_with('}'));
    }
}

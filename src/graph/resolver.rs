//! Dependency graph construction and ordering.
//!
//! Edges come from two sources: the explicit `depends_on` list of each unit
//! and the `${unit.output}` tokens found in its document. Ordering is a
//! Kahn topological sort that always picks the earliest-declared ready unit,
//! so the same input always produces the same order.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::GraphError;
use crate::planner::reference::references;
use crate::unit::DeployableUnit;

use super::handle::OutputHandle;

/// How an edge was declared.
#[derive(Debug, Clone)]
pub enum EdgeKind {
    /// Listed in `depends_on`.
    Explicit,
    /// Implied by output references; carries the producer's handle.
    Implicit(OutputHandle),
}

/// An edge from a unit to one of its dependencies.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Index of the dependency.
    pub dependency: usize,
    /// How the edge was declared. A referenced dependency is implicit
    /// even when it is also listed explicitly.
    pub kind: EdgeKind,
}

/// The dependency graph of one run.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Units in declaration order.
    units: Vec<DeployableUnit>,
    /// Unit id to declaration index.
    index: HashMap<String, usize>,
    /// Outgoing edges per unit, deduplicated by dependency.
    edges: Vec<Vec<Edge>>,
    /// Reverse adjacency: dependents per unit.
    dependents: Vec<Vec<usize>>,
    /// One output handle per unit.
    handles: Vec<OutputHandle>,
}

impl DependencyGraph {
    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate ids or on edges to units that are not
    /// part of the run.
    pub fn build(units: Vec<DeployableUnit>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(units.len());
        for (i, unit) in units.iter().enumerate() {
            if index.insert(unit.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateUnit {
                    unit: unit.id.clone(),
                });
            }
        }

        let handles: Vec<OutputHandle> = units.iter().map(|u| OutputHandle::new(&u.id)).collect();
        let mut edges: Vec<Vec<Edge>> = vec![Vec::new(); units.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); units.len()];

        for (i, unit) in units.iter().enumerate() {
            let lookup = |dependency: &str| {
                index
                    .get(dependency)
                    .copied()
                    .ok_or_else(|| GraphError::UnknownDependency {
                        unit: unit.id.clone(),
                        dependency: dependency.to_string(),
                    })
            };

            for dependency in &unit.depends_on {
                let target = lookup(dependency)?;
                if !edges[i].iter().any(|e| e.dependency == target) {
                    edges[i].push(Edge {
                        dependency: target,
                        kind: EdgeKind::Explicit,
                    });
                }
            }

            for located in references(&unit.document) {
                let Some(producer) = located.reference.producer() else {
                    continue;
                };
                let target = lookup(producer)?;
                let kind = EdgeKind::Implicit(handles[target].clone());
                match edges[i].iter_mut().find(|e| e.dependency == target) {
                    Some(edge) => edge.kind = kind,
                    None => edges[i].push(Edge {
                        dependency: target,
                        kind,
                    }),
                }
            }

            for edge in &edges[i] {
                dependents[edge.dependency].push(i);
            }
        }

        debug!(
            "Built dependency graph: {} units, {} edges",
            units.len(),
            edges.iter().map(Vec::len).sum::<usize>()
        );

        Ok(Self {
            units,
            index,
            edges,
            dependents,
            handles,
        })
    }

    /// Returns the units in declaration order.
    #[must_use]
    pub fn units(&self) -> &[DeployableUnit] {
        &self.units
    }

    /// Returns the number of units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Returns true if the graph has no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Returns the declaration index of a unit.
    #[must_use]
    pub fn index_of(&self, unit_id: &str) -> Option<usize> {
        self.index.get(unit_id).copied()
    }

    /// Returns the unit at a declaration index.
    #[must_use]
    pub fn unit(&self, index: usize) -> Option<&DeployableUnit> {
        self.units.get(index)
    }

    /// Returns the outgoing edges of a unit.
    #[must_use]
    pub fn edges(&self, index: usize) -> &[Edge] {
        self.edges.get(index).map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns the dependency indices of a unit.
    #[must_use]
    pub fn dependencies(&self, index: usize) -> Vec<usize> {
        self.edges(index).iter().map(|e| e.dependency).collect()
    }

    /// Returns the dependent indices of a unit.
    #[must_use]
    pub fn dependents(&self, index: usize) -> &[usize] {
        self.dependents.get(index).map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns the output handle of a unit.
    #[must_use]
    pub fn output_handle(&self, index: usize) -> Option<&OutputHandle> {
        self.handles.get(index)
    }

    /// Returns the handles this unit reads outputs from.
    pub fn inputs(&self, index: usize) -> impl Iterator<Item = &OutputHandle> {
        self.edges(index).iter().filter_map(|e| match &e.kind {
            EdgeKind::Implicit(handle) => Some(handle),
            EdgeKind::Explicit => None,
        })
    }

    /// Computes the deployment order as declaration indices.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] naming every unit on a cycle.
    pub fn resolve(&self) -> Result<Vec<usize>, GraphError> {
        let mut in_degree: Vec<usize> = self.edges.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.units.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &self.dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < self.units.len() {
            let units = self
                .cycle_members()
                .into_iter()
                .map(|i| self.units[i].id.clone())
                .collect();
            return Err(GraphError::Cycle { units });
        }

        Ok(order)
    }

    /// Computes the teardown order: the deployment order reversed.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] naming every unit on a cycle.
    pub fn teardown_order(&self) -> Result<Vec<usize>, GraphError> {
        let mut order = self.resolve()?;
        order.reverse();
        Ok(order)
    }

    /// Returns every unit on a cycle, in declaration order.
    fn cycle_members(&self) -> Vec<usize> {
        let mut tarjan = Tarjan::new(self.units.len());
        for v in 0..self.units.len() {
            if tarjan.index[v].is_none() {
                tarjan.visit(v, &self.edges);
            }
        }

        let mut members: Vec<usize> = tarjan
            .components
            .into_iter()
            .filter(|c| c.len() > 1 || self.edges[c[0]].iter().any(|e| e.dependency == c[0]))
            .flatten()
            .collect();
        members.sort_unstable();
        members
    }
}

/// Tarjan's strongly connected components.
struct Tarjan {
    counter: usize,
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    components: Vec<Vec<usize>>,
}

impl Tarjan {
    fn new(n: usize) -> Self {
        Self {
            counter: 0,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            components: Vec::new(),
        }
    }

    fn visit(&mut self, v: usize, edges: &[Vec<Edge>]) {
        self.index[v] = Some(self.counter);
        self.lowlink[v] = self.counter;
        self.counter += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for edge in &edges[v] {
            let w = edge.dependency;
            match self.index[w] {
                None => {
                    self.visit(w, edges);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                }
                Some(w_index) if self.on_stack[w] => {
                    self.lowlink[v] = self.lowlink[v].min(w_index);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[v]) == self.index[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}

/// Orders units for deployment.
///
/// # Errors
///
/// Returns an error on duplicate ids, unknown dependencies or cycles.
pub fn resolve(units: &[DeployableUnit]) -> Result<Vec<DeployableUnit>, GraphError> {
    let graph = DependencyGraph::build(units.to_vec())?;
    let order = graph.resolve()?;
    Ok(order.into_iter().map(|i| graph.units[i].clone()).collect())
}

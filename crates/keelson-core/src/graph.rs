// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dependency graph resolver.
//!
//! Builds the DAG induced by step argument references, rejects malformed graphs and
//! groups steps into ready sets: every step in layer `n` depends only on steps in
//! layers `< n`. Runs once when a workflow is built, never per execution.

use std::collections::{HashMap, HashSet};

use crate::error::DefinitionError;

/// A step as seen by the resolver.
#[derive(Debug, Clone, Copy)]
pub struct StepNode<'a> {
    /// Step name.
    pub name: &'a str,
    /// Steps this step depends on.
    pub steps: &'a [&'a str],
    /// Inputs this step reads.
    pub inputs: &'a [&'a str],
}

/// Validated execution order of a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    layers: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl ExecutionPlan {
    /// Ready sets, as indices into the step list, each sorted by declaration order.
    pub fn layers(&self) -> &[Vec<usize>] {
        &self.layers
    }

    /// A total order consistent with every dependency edge.
    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Validate the graph and compute its execution plan.
pub fn resolve(inputs: &[&str], nodes: &[StepNode<'_>]) -> Result<ExecutionPlan, DefinitionError> {
    let mut declared_inputs = HashSet::new();
    for input in inputs {
        if input.is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if !declared_inputs.insert(*input) {
            return Err(DefinitionError::DuplicateInput(input.to_string()));
        }
    }

    let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        if node.name.is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if index.insert(node.name, i).is_some() {
            return Err(DefinitionError::DuplicateStep(node.name.to_string()));
        }
    }

    let mut edges: Vec<Vec<usize>> = Vec::with_capacity(nodes.len());
    for node in nodes {
        for input in node.inputs {
            if !declared_inputs.contains(input) {
                return Err(DefinitionError::UnknownInput {
                    step: node.name.to_string(),
                    input: input.to_string(),
                });
            }
        }
        let deps = node
            .steps
            .iter()
            .map(|dep| {
                index
                    .get(dep)
                    .copied()
                    .ok_or_else(|| DefinitionError::UnknownStep {
                        step: node.name.to_string(),
                        reference: dep.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        edges.push(deps);
    }

    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut depth = vec![0usize; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    let mut path = Vec::new();

    for start in 0..nodes.len() {
        visit(start, nodes, &edges, &mut marks, &mut depth, &mut order, &mut path)?;
    }

    let layer_count = depth.iter().copied().max().map_or(0, |d| d + 1);
    let mut layers = vec![Vec::new(); layer_count];
    for (i, d) in depth.iter().enumerate() {
        layers[*d].push(i);
    }

    Ok(ExecutionPlan { layers, order })
}

/// Depth-first traversal with visiting/visited markers.
///
/// Post-order appends give a topological order; `depth` is the longest path from
/// a root, which is the step's ready-set index.
fn visit(
    i: usize,
    nodes: &[StepNode<'_>],
    edges: &[Vec<usize>],
    marks: &mut [Mark],
    depth: &mut [usize],
    order: &mut Vec<usize>,
    path: &mut Vec<usize>,
) -> Result<(), DefinitionError> {
    match marks[i] {
        Mark::Visited => return Ok(()),
        Mark::Visiting => {
            let from = path.iter().position(|&p| p == i).unwrap_or(0);
            let mut cycle: Vec<String> = path[from..]
                .iter()
                .map(|&p| nodes[p].name.to_string())
                .collect();
            cycle.push(nodes[i].name.to_string());
            return Err(DefinitionError::Cycle(cycle));
        }
        Mark::Unvisited => {}
    }

    marks[i] = Mark::Visiting;
    path.push(i);

    let mut d = 0;
    for &dep in &edges[i] {
        visit(dep, nodes, edges, marks, depth, order, path)?;
        d = d.max(depth[dep] + 1);
    }

    path.pop();
    marks[i] = Mark::Visited;
    depth[i] = d;
    order.push(i);
    Ok(())
}

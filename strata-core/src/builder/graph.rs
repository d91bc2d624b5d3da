//! Stage dependency graph.
//!
//! Derives a DAG from stage base references and copy directives, enforces
//! define-before-use ordering, and produces the execution plan: topological
//! order, concurrency waves, and the transitive requirement set of a target.

use crate::builder::parser::{BaseRef, Instruction, Pipeline};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// A directed acyclic graph over pipeline stages.
///
/// Stage indexes are positions in the pipeline's declaration order.
#[derive(Debug, Clone)]
pub struct StageGraph {
    /// Per-stage dependency lists: stage index -> stages it references
    pub dependencies: Vec<Vec<usize>>,
    /// Adjacency list: stage index -> dependent stage indexes
    pub edges: HashMap<usize, Vec<usize>>,
    /// Stage names, for diagnostics
    pub stage_names: Vec<String>,
}

/// Error type for graph construction and ordering.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    #[error("Circular dependency between stages: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error(
        "Stage '{stage}' references '{referenced}', which is not defined before it; \
         stages may only reference earlier stages"
    )]
    ForwardReference { stage: String, referenced: String },

    #[error("Unknown stage reference: {name}")]
    UnknownStage { name: String },
}

impl StageGraph {
    /// Builds the dependency graph for a parsed pipeline.
    ///
    /// Every base reference and copy source adds an edge from the referenced
    /// stage to the referencing one. A reference to a stage at the same or a
    /// later position is a [`GraphError::ForwardReference`]; the parser has
    /// already rejected names that exist nowhere.
    pub fn build(pipeline: &Pipeline) -> Result<Self, GraphError> {
        let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(pipeline.stages.len());
        let mut edges: HashMap<usize, Vec<usize>> = HashMap::new();

        for (position, stage) in pipeline.stages.iter().enumerate() {
            let mut refs: Vec<&str> = Vec::new();

            if let BaseRef::Stage(name) = &stage.base {
                refs.push(name);
            }
            for inst in &stage.instructions {
                if let Instruction::CopyFrom { source_stage, .. } = inst {
                    refs.push(source_stage);
                }
            }

            let mut deps = Vec::new();
            for reference in refs {
                let dep = pipeline
                    .stage_index(reference)
                    .ok_or_else(|| GraphError::UnknownStage {
                        name: reference.to_string(),
                    })?;

                if dep >= position {
                    return Err(GraphError::ForwardReference {
                        stage: stage.name.clone(),
                        referenced: pipeline.stages[dep].name.clone(),
                    });
                }

                if !deps.contains(&dep) {
                    deps.push(dep);
                    edges.entry(dep).or_default().push(position);
                }
            }

            dependencies.push(deps);
        }

        Ok(Self {
            dependencies,
            edges,
            stage_names: pipeline.stages.iter().map(|s| s.name.clone()).collect(),
        })
    }

    /// Returns stage indexes in execution order (Kahn's algorithm).
    ///
    /// Construction already guarantees acyclicity; the cycle check remains
    /// for graphs assembled by hand.
    pub fn topological_sort(&self) -> Result<Vec<usize>, GraphError> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(|deps| deps.len()).collect();

        let mut queue: VecDeque<usize> = (0..self.dependencies.len())
            .filter(|&idx| in_degree[idx] == 0)
            .collect();
        let mut result = Vec::with_capacity(self.dependencies.len());

        while let Some(idx) = queue.pop_front() {
            result.push(idx);
            if let Some(dependents) = self.edges.get(&idx) {
                for &dependent in dependents {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if result.len() != self.dependencies.len() {
            let cycle: Vec<String> = (0..self.dependencies.len())
                .filter(|idx| !result.contains(idx))
                .map(|idx| self.stage_names[idx].clone())
                .collect();
            return Err(GraphError::Cycle { cycle });
        }

        Ok(result)
    }

    /// The transitive dependency closure of `target`, including itself.
    ///
    /// Stages outside this set are never executed (lazy evaluation).
    pub fn required_for(&self, target: usize) -> HashSet<usize> {
        let mut required = HashSet::new();
        let mut stack = vec![target];

        while let Some(idx) = stack.pop() {
            if required.insert(idx) {
                stack.extend(self.dependencies[idx].iter().copied());
            }
        }

        required
    }

    /// Partition the required stages into concurrency waves.
    ///
    /// Wave k holds stages whose dependencies all completed in earlier
    /// waves; within a wave, stages keep declaration order. Dependencies
    /// always have lower indexes, so one pass in index order suffices.
    pub fn waves(&self, required: &HashSet<usize>) -> Vec<Vec<usize>> {
        let mut level: HashMap<usize, usize> = HashMap::new();
        let mut waves: Vec<Vec<usize>> = Vec::new();

        let mut ordered: Vec<usize> = required.iter().copied().collect();
        ordered.sort_unstable();

        for idx in ordered {
            let wave = self.dependencies[idx]
                .iter()
                .filter(|dep| required.contains(dep))
                .map(|dep| level[dep] + 1)
                .max()
                .unwrap_or(0);

            level.insert(idx, wave);
            if waves.len() <= wave {
                waves.resize_with(wave + 1, Vec::new);
            }
            waves[wave].push(idx);
        }

        waves
    }

    /// Dependencies of one stage.
    pub fn dependencies_of(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }
}

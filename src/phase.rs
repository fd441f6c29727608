//! Dependency analysis: split a step list into execution phases.
//!
//! Batches are formed in declaration order. A step joins the open batch
//! unless it requires a variable produced by a step already in that batch,
//! in which case a new batch starts. Members of one batch never see each
//! other's outputs; results merge after the batch joins.

use crate::config::ExecutionMode;
use crate::error::ChainError;
use crate::step::Step;
use crate::value::Variables;
use std::collections::HashSet;

/// A group of steps sharing one scheduling strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase<'a> {
    /// One step at a time, in order; each sees the previous one's outputs.
    Sequential(Vec<&'a Step>),
    /// All members launched together and joined before merging.
    Parallel(Vec<&'a Step>),
}

impl<'a> Phase<'a> {
    pub fn steps(&self) -> &[&'a Step] {
        match self {
            Phase::Sequential(steps) | Phase::Parallel(steps) => steps,
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, Phase::Parallel(_))
    }
}

/// Dependency batches in execution order.
pub fn plan_batches(steps: &[Step]) -> Vec<Vec<&Step>> {
    let mut batches = Vec::new();
    let mut current: Vec<&Step> = Vec::new();
    let mut produced: HashSet<&str> = HashSet::new();

    for step in steps {
        let depends = step
            .required_variables
            .iter()
            .any(|name| produced.contains(name.as_str()));
        if depends && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            produced.clear();
        }
        produced.extend(step.declared_outputs());
        current.push(step);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Phases for a scheduling mode.
///
/// Hybrid mode folds consecutive single-step batches into one sequential
/// phase; larger batches stay parallel.
pub fn plan_phases(steps: &[Step], mode: ExecutionMode) -> Vec<Phase<'_>> {
    match mode {
        ExecutionMode::Sequential => {
            if steps.is_empty() {
                Vec::new()
            } else {
                vec![Phase::Sequential(steps.iter().collect())]
            }
        }
        ExecutionMode::Parallel => plan_batches(steps).into_iter().map(Phase::Parallel).collect(),
        ExecutionMode::Hybrid => {
            let mut phases: Vec<Phase<'_>> = Vec::new();
            for batch in plan_batches(steps) {
                if batch.len() > 1 {
                    phases.push(Phase::Parallel(batch));
                    continue;
                }
                match phases.last_mut() {
                    Some(Phase::Sequential(run)) => run.extend(batch),
                    _ => phases.push(Phase::Sequential(batch)),
                }
            }
            phases
        }
    }
}

/// Launch order for a parallel phase: higher priority first, declaration
/// order within a priority. Returns indices into `steps`.
pub fn launch_order(steps: &[&Step]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..steps.len()).collect();
    order.sort_by(|a, b| steps[*b].priority.cmp(&steps[*a].priority));
    order
}

/// Reject chains whose steps depend on each other in a loop.
///
/// Step A depends on step B when A requires a variable B declares as output
/// and the variable is not already in `available`.
pub fn check_cycles(steps: &[Step], available: &Variables) -> Result<(), ChainError> {
    let edges: Vec<Vec<usize>> = steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let mut deps = Vec::new();
            for name in &step.required_variables {
                if available.contains_key(name) {
                    continue;
                }
                for (j, producer) in steps.iter().enumerate() {
                    if j != i && producer.declared_outputs().contains(&name.as_str()) && !deps.contains(&j) {
                        deps.push(j);
                    }
                }
            }
            deps
        })
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Active,
        Done,
    }

    fn visit(node: usize, edges: &[Vec<usize>], marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[node] = Mark::Active;
        path.push(node);
        for &next in &edges[node] {
            match marks[next] {
                Mark::Active => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, edges, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        path.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; steps.len()];
    for start in 0..steps.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        let mut path = Vec::new();
        if let Some(cycle) = visit(start, &edges, &mut marks, &mut path) {
            let names: Vec<String> = cycle.iter().map(|&i| format!("step {}", steps[i].id)).collect();
            return Err(ChainError::validation(format!(
                "Circular dependency detected: {}",
                names.join(" -> ")
            )));
        }
    }
    Ok(())
}

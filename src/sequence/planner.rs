//! Execution Planner
//!
//! Compiles a validated sequence graph into linear execution chains, one per
//! concurrent branch, plus the join points where branches meet.
//!
//! Chains are built from a work stack seeded with the Begin block:
//! - A chain follows the first output of each block it compiles
//! - Every other output of a block seeds a new chain, gated behind the
//!   release of that block's join point
//! - A chain only enters a block whose first input is the block it came
//!   from; otherwise it stops there and waits on that block's join point
//!
//! Every block is therefore compiled into exactly one chain.

use std::collections::BTreeMap;

use log::debug;

use super::model::{BlockType, Sequence};
use crate::error::SequenceError;

/// What a chain waits for before running its first step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainGate {
    /// The start barrier of the owning sequence run
    SequenceStart,
    /// The release of the join point at the given block index
    JoinRelease(usize),
}

/// An ordered list of steps executed by one concurrent unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionChain {
    /// Position of the chain in the plan
    pub index: usize,
    /// Barrier opening the chain
    pub gate: ChainGate,
    /// Block indices executed in order
    pub steps: Vec<usize>,
    /// Join point the chain arrives at once its steps are done
    pub join_target: Option<usize>,
    /// True if the chain ends on a block without outputs
    pub terminal: bool,
}

impl ExecutionChain {
    fn new(index: usize, gate: ChainGate) -> Self {
        Self {
            index,
            gate,
            steps: Vec::new(),
            join_target: None,
            terminal: false,
        }
    }
}

/// A Branch block and the chains that must reach it before it fires.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinPointSpec {
    /// Index of the Branch block
    pub block: usize,
    /// Number of arrivals before the join fires (one per input link)
    pub expected: usize,
    /// Chains that stop in front of the block and only arrive
    pub waiting_chains: Vec<usize>,
}

/// Chains and join points of one sequence run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    pub chains: Vec<ExecutionChain>,
    pub join_points: BTreeMap<usize, JoinPointSpec>,
}

impl ExecutionPlan {
    /// Chains ending on an End block; their outcomes decide the run.
    pub fn end_chains(&self) -> impl Iterator<Item = &ExecutionChain> {
        self.chains.iter().filter(|c| c.terminal)
    }

    /// Chains started by the release of the join point at `block`.
    pub fn chains_gated_by(&self, block: usize) -> Vec<usize> {
        self.chains
            .iter()
            .filter(|c| c.gate == ChainGate::JoinRelease(block))
            .map(|c| c.index)
            .collect()
    }

    pub fn join_point(&self, block: usize) -> Option<&JoinPointSpec> {
        self.join_points.get(&block)
    }

    /// Number of compiled steps over all chains.
    pub fn step_count(&self) -> usize {
        self.chains.iter().map(|c| c.steps.len()).sum()
    }
}

/// Builds the execution plan of a validated sequence.
pub fn build_plan(sequence: &Sequence) -> Result<ExecutionPlan, SequenceError> {
    let begin = sequence
        .blocks
        .iter()
        .position(|b| b.block_type == BlockType::Begin)
        .ok_or_else(|| SequenceError::structural("No Begin block"))?;

    let lookup = |id: &str, from: &str| {
        sequence.index_of(id).ok_or_else(|| {
            SequenceError::syntax(format!(
                "The block {} references a non-existing block ({})",
                from, id
            ))
        })
    };

    let mut plan = ExecutionPlan::default();
    let mut compiled = vec![false; sequence.blocks.len()];
    // (chain, block the chain comes from, next block)
    let mut stack: Vec<(usize, Option<usize>, usize)> = Vec::new();

    plan.chains.push(ExecutionChain::new(0, ChainGate::SequenceStart));
    stack.push((0, None, begin));

    while let Some((chain, mut previous, mut current)) = stack.pop() {
        loop {
            let block = &sequence.blocks[current];

            if let Some(prev) = previous {
                let prev_id = &sequence.blocks[prev].id;
                if block.inputs.first() != Some(prev_id) {
                    plan.chains[chain].join_target = Some(current);
                    break;
                }
            }

            if compiled[current] {
                return Err(SequenceError::structural(format!(
                    "A circular link involves the block '{}'",
                    block.id
                )));
            }
            compiled[current] = true;
            plan.chains[chain].steps.push(current);

            if block.block_type == BlockType::Branch {
                plan.join_points.insert(
                    current,
                    JoinPointSpec {
                        block: current,
                        expected: block.inputs.len(),
                        waiting_chains: Vec::new(),
                    },
                );
            }

            for out in block.outputs.iter().skip(1) {
                let target = lookup(out.as_str(), block.id.as_str())?;
                let index = plan.chains.len();
                plan.chains
                    .push(ExecutionChain::new(index, ChainGate::JoinRelease(current)));
                stack.push((index, Some(current), target));
            }

            match block.outputs.first() {
                Some(out) => {
                    previous = Some(current);
                    current = lookup(out.as_str(), block.id.as_str())?;
                }
                None => {
                    plan.chains[chain].terminal = true;
                    break;
                }
            }
        }
    }

    for chain in &plan.chains {
        if let Some(target) = chain.join_target {
            let join = plan.join_points.get_mut(&target).ok_or_else(|| {
                SequenceError::structural(format!(
                    "Branches converge into the block '{}' without a Branch block",
                    sequence.blocks[target].id
                ))
            })?;
            join.waiting_chains.push(chain.index);
        }
    }

    debug!(
        "Plan for '{}': {} chain(s), {} join point(s), {} step(s)",
        sequence.id,
        plan.chains.len(),
        plan.join_points.len(),
        plan.step_count()
    );

    Ok(plan)
}

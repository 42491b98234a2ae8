//! Sequence Validation
//!
//! Accepts or rejects a sequence graph before it can be executed:
//! - Block field validation (ids, link cardinality, type-specific properties)
//! - Reference integrity (links and macro subsequences)
//! - Graph structure (single entry, reachable exits, reciprocity, no cycles,
//!   no orphaned blocks)
//!
//! Validation is a pure check and recurses into subsequences and backups.

use std::collections::HashSet;

use log::{debug, info};

use super::model::{Block, BlockType, Cardinality, Sequence, MAX_SECONDS};
use crate::error::SequenceError;

/// Characters that may not appear in sequence or block ids.
const FORBIDDEN_ID_CHARS: &[char] = &['/', '\\', '~', '<', '>'];

/// Checks that an id is non-empty and free of forbidden characters.
pub fn check_id(id: &str, what: &str) -> Result<(), SequenceError> {
    if id.trim().is_empty() {
        return Err(SequenceError::syntax(format!("A {} has an empty ID", what)));
    }
    if id.contains(FORBIDDEN_ID_CHARS) {
        return Err(SequenceError::syntax(format!("Invalid {} ID ({})", what, id)));
    }
    Ok(())
}

/// Validates a sequence and, recursively, its subsequences and backup.
///
/// Performs the following checks, syntax first:
/// 1. Ids are valid and unique
/// 2. Link counts and properties match each block type
/// 3. Links and macro calls reference existing blocks and subsequences
/// 4. Exactly one Begin block and at least one End block
/// 5. Every link is reciprocal
/// 6. No cycle is reachable from Begin
/// 7. Every block is reachable from Begin
pub fn validate_sequence(sequence: &Sequence) -> Result<(), SequenceError> {
    info!(
        "Validating sequence '{}' ({} blocks, level {})",
        sequence.id,
        sequence.blocks.len(),
        sequence.level
    );

    check_syntax(sequence)?;
    check_structure(sequence)?;

    for sub in sequence.subsequences.values() {
        validate_sequence(sub)?;
    }
    if let Some(backup) = &sequence.backup {
        validate_sequence(backup)?;
    }

    debug!("Sequence '{}' is executable", sequence.id);
    Ok(())
}

fn check_syntax(sequence: &Sequence) -> Result<(), SequenceError> {
    check_id(&sequence.id, "sequence")?;

    let mut seen: HashSet<&str> = HashSet::new();
    for block in &sequence.blocks {
        check_id(&block.id, "block")?;
        if !seen.insert(block.id.as_str()) {
            return Err(SequenceError::syntax(format!(
                "More than one block with the ID : {}",
                block.id
            )));
        }
    }

    for block in &sequence.blocks {
        check_links(block, &seen)?;
        check_properties(sequence, block)?;
    }
    Ok(())
}

fn check_links(block: &Block, known: &HashSet<&str>) -> Result<(), SequenceError> {
    for (links, rule, name) in [
        (&block.inputs, block.block_type.inputs(), "input"),
        (&block.outputs, block.block_type.outputs(), "output"),
    ] {
        match rule {
            Cardinality::Zero if !links.is_empty() => {
                return Err(SequenceError::syntax(format!(
                    "The block {} shouldn't have an {}",
                    block.id, name
                )));
            }
            Cardinality::One | Cardinality::Many if links.is_empty() => {
                return Err(SequenceError::syntax(format!(
                    "The block {} should have an {}",
                    block.id, name
                )));
            }
            Cardinality::One if links.len() > 1 && name == "input" => {
                // Reconvergence is only allowed through an explicit Branch.
                return Err(SequenceError::structural(format!(
                    "Branches converge into the {} block '{}' without a Branch block",
                    block.block_type, block.id
                )));
            }
            Cardinality::One if links.len() > 1 => {
                return Err(SequenceError::syntax(format!(
                    "The block {} shouldn't have more than one {}",
                    block.id, name
                )));
            }
            _ => {}
        }

        let mut unique: HashSet<&str> = HashSet::new();
        for link in links.iter() {
            if !known.contains(link.as_str()) {
                return Err(SequenceError::syntax(format!(
                    "The block {} references a non-existing block ({})",
                    block.id, link
                )));
            }
            if !unique.insert(link.as_str()) {
                return Err(SequenceError::syntax(format!(
                    "The block {} lists the {} '{}' twice",
                    block.id, name, link
                )));
            }
        }
    }
    Ok(())
}

fn check_properties(sequence: &Sequence, block: &Block) -> Result<(), SequenceError> {
    let allowed = block.block_type.allowed_properties();
    for name in block.properties.present() {
        if !allowed.contains(&name) {
            return Err(SequenceError::syntax(format!(
                "The block '{}' shouldn't have a property '{}'",
                block.id, name
            )));
        }
    }

    let props = &block.properties;
    match block.block_type {
        BlockType::Action => {
            let module = props.module.as_deref().unwrap_or("");
            if module.trim().is_empty() {
                return Err(SequenceError::syntax(format!(
                    "The block '{}' should have a property 'module'",
                    block.id
                )));
            }
        }
        BlockType::Macro => {
            if let Some(sub_id) = &props.sequence_id {
                if !sequence.subsequences.contains_key(sub_id) {
                    return Err(SequenceError::syntax(format!(
                        "There is no subsequence called {}",
                        sub_id
                    )));
                }
            }
        }
        _ => {}
    }

    if props.iteration == Some(0) {
        return Err(SequenceError::syntax(format!(
            "The block '{}' must iterate at least once",
            block.id
        )));
    }
    for (name, value) in [("tick", props.tick), ("time", props.time)] {
        if let Some(value) = value {
            if !(0.0..=MAX_SECONDS).contains(&value) {
                return Err(SequenceError::syntax(format!(
                    "Couldn't use {} = {} on block '{}'",
                    name, value, block.id
                )));
            }
        }
    }

    if !block.parameters.is_empty() && block.block_type != BlockType::Action {
        return Err(SequenceError::syntax(format!(
            "The block '{}' shouldn't have parameters",
            block.id
        )));
    }
    Ok(())
}

fn check_structure(sequence: &Sequence) -> Result<(), SequenceError> {
    let begin_count = count(sequence, BlockType::Begin);
    if begin_count == 0 {
        return Err(SequenceError::structural("No Begin block"));
    }
    if begin_count > 1 {
        return Err(SequenceError::structural("More than one Begin block"));
    }
    if count(sequence, BlockType::End) == 0 {
        return Err(SequenceError::structural("No End block"));
    }

    check_reciprocity(sequence)?;

    let begin = sequence
        .blocks
        .iter()
        .position(|b| b.block_type == BlockType::Begin)
        .ok_or_else(|| SequenceError::structural("No Begin block"))?;

    let reached = check_cycles(sequence, begin)?;
    let excluded = sequence.blocks.len() - reached.len();
    if excluded != 0 {
        return Err(SequenceError::structural(format!(
            "{} block(s) are excluded from the main sequence",
            excluded
        )));
    }
    Ok(())
}

fn count(sequence: &Sequence, block_type: BlockType) -> usize {
    sequence
        .blocks
        .iter()
        .filter(|b| b.block_type == block_type)
        .count()
}

fn check_reciprocity(sequence: &Sequence) -> Result<(), SequenceError> {
    for block in &sequence.blocks {
        for out in &block.outputs {
            let target = sequence.get_block(out);
            if !target.map_or(false, |t| t.inputs.contains(&block.id)) {
                return Err(SequenceError::structural(format!(
                    "Reciprocity Error between blocks '{}' and '{}'",
                    block.id, out
                )));
            }
        }
        for inp in &block.inputs {
            let source = sequence.get_block(inp);
            if !source.map_or(false, |s| s.outputs.contains(&block.id)) {
                return Err(SequenceError::structural(format!(
                    "Reciprocity Error between blocks '{}' and '{}'",
                    inp, block.id
                )));
            }
        }
    }
    Ok(())
}

/// Depth-first walk from Begin tracking the blocks on the current path.
///
/// Fails as soon as a block already on the path is entered again, and
/// returns the set of reachable block indices otherwise.
fn check_cycles(sequence: &Sequence, begin: usize) -> Result<HashSet<usize>, SequenceError> {
    let mut on_path = vec![false; sequence.blocks.len()];
    let mut done: HashSet<usize> = HashSet::new();
    // (block, next output to visit)
    let mut stack: Vec<(usize, usize)> = vec![(begin, 0)];
    on_path[begin] = true;

    while let Some((current, next)) = stack.last().copied() {
        let block = &sequence.blocks[current];
        match block.outputs.get(next) {
            Some(out) => {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let target = sequence.index_of(out).ok_or_else(|| {
                    SequenceError::syntax(format!(
                        "The block {} references a non-existing block ({})",
                        block.id, out
                    ))
                })?;
                if on_path[target] {
                    return Err(SequenceError::structural(format!(
                        "A circular link involves the block '{}'",
                        sequence.blocks[target].id
                    )));
                }
                if !done.contains(&target) {
                    on_path[target] = true;
                    stack.push((target, 0));
                }
            }
            None => {
                on_path[current] = false;
                done.insert(current);
                stack.pop();
            }
        }
    }

    Ok(done)
}

/// Quick validation that returns a list of error messages.
///
/// Useful for editor feedback; stops at the first error of each sequence.
pub fn quick_validate(sequence: &Sequence) -> Vec<String> {
    let mut errors = Vec::new();
    if let Err(e) = check_syntax(sequence).and_then(|_| check_structure(sequence)) {
        errors.push(format!("{}: {}", sequence.id, e));
    }
    for sub in sequence.subsequences.values() {
        errors.extend(quick_validate(sub));
    }
    if let Some(backup) = &sequence.backup {
        errors.extend(quick_validate(backup));
    }
    errors
}

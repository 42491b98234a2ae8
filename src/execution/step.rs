//! Individual Step Execution
//!
//! Dispatches one compiled step of a chain according to its block type:
//! - Begin, End: bookkeeping only
//! - TimeInit: resets the time reference of the run
//! - Branch: waits for every incoming chain, then releases the outgoing ones
//! - Wait: relative sleep or absolute deadline on the time reference
//! - Action: drives the bound plugin through its lifecycle
//! - Macro: runs the called subsequence once per iteration
//!
//! Each step is framed by a `Begin` state event and an `Ok`/`Failed` one.

use log::Level;

use super::runner::SequenceRun;
use crate::action::{execute_action, ActionContext};
use crate::monitoring::{BlockState, RunLogger};
use crate::sequence::{seconds, Block, BlockType};

/// Executes the block at `index` and returns its outcome.
pub(crate) fn execute_step(run: &SequenceRun, index: usize) -> bool {
    let Some(block) = run.sequence().blocks.get(index) else {
        return false;
    };
    let log = run.logger_for(block);

    log.state(BlockState::Begin);
    let ok = match block.block_type {
        BlockType::Begin | BlockType::End => {
            log.mark(Level::Info);
            true
        }
        BlockType::TimeInit => {
            run.time_reference().reset();
            log.mark(Level::Info);
            true
        }
        BlockType::Branch => execute_branch(run, index, block, &log),
        BlockType::Wait => execute_wait(run, block, &log),
        BlockType::Action => execute_action_block(run, block, log.clone()),
        BlockType::Macro => execute_macro(run, block, &log),
    };
    log.state(if ok { BlockState::Ok } else { BlockState::Failed });
    ok
}

fn execute_branch(run: &SequenceRun, index: usize, block: &Block, log: &RunLogger) -> bool {
    let Some(join) = run.join_point(index) else {
        log.error("No join point registered");
        return false;
    };

    join.arrive();
    if !join.wait_all() || run.controller().is_stopped() {
        log.warning("The stop mechanism has been activated while waiting for the threads");
        return false;
    }

    if block.inputs.len() > 1 {
        log.info(format!("The {} threads have met", block.inputs.len()));
    }
    if block.outputs.len() > 1 {
        log.info(format!("{} threads have been started", block.outputs.len()));
    }
    join.release();
    true
}

fn execute_wait(run: &SequenceRun, block: &Block, log: &RunLogger) -> bool {
    let time = block.properties.time();
    let done = if block.properties.absolute() {
        log.info(format!("Wait for t={}s", time));
        run.time_reference()
            .wait_until(seconds(time), run.controller().stop_event())
    } else {
        log.info(format!("Wait {}s", time));
        run.controller().sleep(seconds(time))
    };

    if done {
        log.info("Done");
    } else {
        log.warning("The stop mechanism has been activated during the wait");
    }
    done
}

fn execute_action_block(run: &SequenceRun, block: &Block, log: RunLogger) -> bool {
    let (mut action, parameters) = match run.context().registry.create(block) {
        Ok(created) => created,
        Err(e) => {
            log.error(e.to_string());
            return false;
        }
    };

    let mut ctx = ActionContext::new(
        log,
        parameters,
        block.properties.iteration(),
        block.properties.tick(),
        run.controller().clone(),
    );
    execute_action(action.as_mut(), &mut ctx)
}

fn execute_macro(run: &SequenceRun, block: &Block, log: &RunLogger) -> bool {
    let Some(sub_id) = block.properties.sequence_id.as_deref() else {
        log.info("No subsequence to run");
        return true;
    };
    let Some(sub) = run.sequence().subsequence_for(block) else {
        log.error(format!("There is no subsequence called {}", sub_id));
        return false;
    };

    let parent = run.controller();
    let iteration = block.properties.iteration();
    let tick = seconds(block.properties.tick());

    for i in 1..=iteration {
        if iteration > 1 {
            log.info(format!("Call : {} (iteration {})", sub.id, i));
        } else {
            log.info(format!("Call : {}", sub.id));
        }

        let child = parent.nested(sub.id.as_str(), sub.level);
        child.arm();
        if parent.is_stopped() {
            child.request_stop();
        }

        let ok = match SequenceRun::new(sub.clone(), child.clone(), run.context().clone()) {
            Ok(nested) => nested.run(),
            Err(e) => {
                log.error(e.to_string());
                false
            }
        };
        child.disarm();
        parent.unregister_child(&child);

        if !ok {
            return false;
        }
        if i == iteration {
            break;
        }
        if !tick.is_zero() {
            log.info(format!("Tick ({}s)", tick.as_secs_f64()));
        }
        if !parent.sleep(tick) {
            log.warning(format!(
                "The stop mechanism has been activated during the tick {}",
                i
            ));
            return false;
        }
    }
    true
}

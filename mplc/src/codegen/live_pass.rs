//! Backward liveness over each basic block.
//!
//! Walks every block back to front, marking each operand live where it
//! is read and recording on each quad whether its result is read again
//! before the block ends. A quad whose only effect is a dead temp is
//! removed outright, together with the temp itself. Temps have one
//! definition and at most one use, so a surviving temp is live for a
//! short, known window; the pass also records the peak number of temps
//! live at once so the emitter can size the spill region.

use crate::{Error, Result};
use ir::{Handle, OpClass, Ppd, StorageClass};
use std::collections::HashSet;
use std::mem;

pub fn sweep(prog: &mut Ppd, routine: Handle) -> Result<()> {
    let name = prog.get(routine).name().to_string();
    log::trace!("liveness: {name}");

    let mut blocks = mem::take(&mut prog.get_mut(routine).as_routine_mut()?.blocks);
    let mut peak = 0usize;
    for block in &mut blocks {
        scan(prog, &mut block.insts, &mut peak)?;
    }
    // A block can lose every quad it had to dead-temp pruning.
    blocks.retain(|b| !b.is_empty());

    let r = prog.get_mut(routine).as_routine_mut()?;
    r.concurrent_temps = peak;
    r.blocks = blocks;
    log::trace!("liveness: {name} needs {peak} temp slots");
    Ok(())
}

fn scan(prog: &mut Ppd, insts: &mut Vec<ir::Quad>, peak: &mut usize) -> Result<()> {
    // Operands of the most recently scanned quad, i.e. the next one in
    // program order.
    let mut arg1: Option<Handle> = None;
    let mut arg2: Option<Handle> = None;
    let mut live_temps: HashSet<Handle> = HashSet::new();

    let mut idx = insts.len();
    while idx > 0 {
        idx -= 1;
        let quad = insts[idx];

        match quad.op.class() {
            OpClass::NoArg => {}
            OpClass::SrcOnly => {
                if let Some(left) = quad.left {
                    mark_live(prog, left, &mut live_temps);
                }
                insts[idx].used_next = false;
                // A call may define a temp even though this class has no
                // tracked result; it occupies a spill slot from the call
                // until its use, read or not.
                if let Some(result) = quad.result {
                    if prog.get(result).sclass() == StorageClass::Temp {
                        if !live_temps.contains(&result) {
                            *peak = (*peak).max(live_temps.len() + 1);
                        }
                        kill(prog, result, &mut live_temps);
                    }
                }
                arg1 = quad.left;
                arg2 = None;
            }
            OpClass::Unary | OpClass::Binary => {
                let result = quad
                    .result
                    .ok_or(Error::UnknownOpcode { pass: "liveness", op: quad.op })?;
                let left = quad
                    .left
                    .ok_or(Error::UnknownOpcode { pass: "liveness", op: quad.op })?;

                let robj = prog.get(result);
                if robj.sclass() == StorageClass::Temp && !robj.live() {
                    // Nothing ever reads this; drop the temp and the quad.
                    let temp = robj.name().to_string();
                    log::debug!("liveness: pruning dead temp {temp}");
                    prog.remove(&temp)?;
                    insts.remove(idx);
                    continue;
                }

                insts[idx].used_next = Some(result) == arg1 || Some(result) == arg2;
                kill(prog, result, &mut live_temps);
                mark_live(prog, left, &mut live_temps);
                arg1 = Some(left);
                arg2 = match quad.op.class() {
                    OpClass::Binary => {
                        let right = quad
                            .right
                            .ok_or(Error::UnknownOpcode { pass: "liveness", op: quad.op })?;
                        mark_live(prog, right, &mut live_temps);
                        Some(right)
                    }
                    _ => None,
                };
            }
        }

        *peak = (*peak).max(live_temps.len());
    }
    Ok(())
}

fn mark_live(prog: &mut Ppd, h: Handle, live_temps: &mut HashSet<Handle>) {
    let obj = prog.get_mut(h);
    obj.set_live(true);
    if obj.sclass() == StorageClass::Temp {
        live_temps.insert(h);
    }
}

fn kill(prog: &mut Ppd, h: Handle, live_temps: &mut HashSet<Handle>) {
    let obj = prog.get_mut(h);
    obj.set_live(false);
    if obj.sclass() == StorageClass::Temp {
        live_temps.remove(&h);
    }
}

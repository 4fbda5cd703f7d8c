//! Splits a routine's linear quad stream into basic blocks.
//!
//! A quad leads a block when it is the first of the routine, when it is
//! a label, or when it follows a terminator. Jumps, conditional jumps,
//! loops, returns and calls terminate their block.

use crate::{Error, Result};
use ir::{Block, Handle, Op, Ppd, Quad};
use std::mem;

/// Drain `code` into `blocks` for one routine. Safe to call again on an
/// already-formed routine: with nothing left in the linear stream the
/// existing blocks are kept.
pub fn form(prog: &mut Ppd, routine: Handle) -> Result<()> {
    let name = prog.get(routine).name().to_string();
    let r = prog.get_mut(routine).as_routine_mut()?;

    if r.code.is_empty() {
        if r.blocks.is_empty() {
            return Err(Error::EmptyRoutine(name));
        }
        return Ok(());
    }

    let code = mem::take(&mut r.code);
    r.blocks = split(code);
    log::debug!("{name}: {} basic blocks", r.blocks.len());
    Ok(())
}

fn split(code: Vec<Quad>) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Vec<Quad> = Vec::new();

    for quad in code {
        if quad.op == Op::Lbl && !current.is_empty() {
            blocks.push(Block::new(mem::take(&mut current)));
        }
        let ends_block = quad.op.is_terminator();
        current.push(quad);
        if ends_block {
            blocks.push(Block::new(mem::take(&mut current)));
        }
    }
    if !current.is_empty() {
        blocks.push(Block::new(current));
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::{Kind, Object, Prime, Routine, StorageClass};

    fn routine_with(prog: &mut Ppd, code: Vec<Quad>) -> Handle {
        let mut r = Routine::new();
        r.code = code;
        prog.add(Object::new("f", StorageClass::Private, Kind::Routine(r)).unwrap())
            .unwrap()
    }

    fn label(prog: &mut Ppd, name: &str) -> Handle {
        prog.add(Object::new(name, StorageClass::Private, Kind::Prime(Prime::new())).unwrap())
            .unwrap()
    }

    #[test]
    fn empty_routine_is_an_error() {
        let mut prog = Ppd::new();
        let f = routine_with(&mut prog, vec![]);
        assert!(matches!(form(&mut prog, f), Err(Error::EmptyRoutine(n)) if n == "f"));
    }

    #[test]
    fn straight_line_code_is_one_block() {
        let mut prog = Ppd::new();
        let f = routine_with(&mut prog, vec![Quad::nop(), Quad::nop(), Quad::nop()]);
        form(&mut prog, f).unwrap();
        let r = prog.get(f).as_routine().unwrap();
        assert_eq!(r.blocks.len(), 1);
        assert_eq!(r.blocks[0].len(), 3);
        assert!(r.code.is_empty());
    }

    #[test]
    fn labels_lead_and_terminators_close() {
        let mut prog = Ppd::new();
        let top = label(&mut prog, "top");
        let code = vec![
            Quad::nop(),
            Quad::src(Op::Lbl, top),
            Quad::nop(),
            Quad::src(Op::Jmp, top),
            Quad::nop(),
        ];
        let f = routine_with(&mut prog, code);
        form(&mut prog, f).unwrap();
        let r = prog.get(f).as_routine().unwrap();
        // [nop] [lbl nop jmp] [nop]
        assert_eq!(r.blocks.len(), 3);
        assert_eq!(r.blocks[0].len(), 1);
        assert_eq!(r.blocks[1].len(), 3);
        assert_eq!(r.blocks[1].insts[0].op, Op::Lbl);
        assert_eq!(r.blocks[1].last().unwrap().op, Op::Jmp);
        assert_eq!(r.blocks[2].len(), 1);
    }

    #[test]
    fn calls_end_their_block() {
        let mut prog = Ppd::new();
        let callee = prog
            .add(Object::new("g", StorageClass::Private, Kind::Routine(Routine::new())).unwrap())
            .unwrap();
        let code = vec![Quad::nop(), Quad::src(Op::Call, callee), Quad::nop()];
        let f = routine_with(&mut prog, code);
        form(&mut prog, f).unwrap();
        let r = prog.get(f).as_routine().unwrap();
        assert_eq!(r.blocks.len(), 2);
        assert_eq!(r.blocks[0].last().unwrap().op, Op::Call);
    }

    #[test]
    fn forming_twice_keeps_the_blocks() {
        let mut prog = Ppd::new();
        let f = routine_with(&mut prog, vec![Quad::nop()]);
        form(&mut prog, f).unwrap();
        form(&mut prog, f).unwrap();
        assert_eq!(prog.get(f).as_routine().unwrap().blocks.len(), 1);
    }
}

//! The back-end pipeline: block forming, liveness, layout, emission.

pub mod block_pass;
pub mod layout_pass;
pub mod live_pass;
pub mod x86;
pub mod x86_pass;

pub use x86::X86Mode;

use crate::{Error, Result};
use ir::Ppd;
use std::io::Write;

/// Generate an x86 assembler file for the program data provided.
///
/// The sink stays open; the caller owns it. The passes run to
/// completion in order, and everything fallible before the first output
/// byte happens first, so a hard error in block forming, liveness or
/// layout leaves the sink untouched.
pub fn x86<W: Write>(out: &mut W, prog: &mut Ppd, mode: X86Mode) -> Result<()> {
    if matches!(mode, X86Mode::Real | X86Mode::Smm) {
        return Err(Error::InvalidMode(mode));
    }
    log::debug!("x86 generation for {mode} mode");

    if prog.is_empty() {
        log::warn!("the program container is empty; nothing to emit");
    }

    let routines: Vec<ir::Handle> = prog
        .iter()
        .filter(|(_, o)| o.is_routine())
        .map(|(h, _)| h)
        .collect();
    for &routine in &routines {
        block_pass::form(prog, routine)?;
        live_pass::sweep(prog, routine)?;
    }
    layout_pass::compute(prog, mode)?;

    writeln!(out, "; MPL generated x86 assembler, {mode} mode")?;
    writeln!(
        out,
        "bits {}",
        match mode {
            X86Mode::Long => 64,
            _ => 32,
        }
    )?;

    layout_pass::declare(out, prog, mode)?;
    x86_pass::emit(out, prog, mode)?;

    writeln!(out, "\n; End of MPL generated file")?;
    Ok(())
}

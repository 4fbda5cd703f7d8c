//! The MPL back end: turns portable program data into native assembler
//! source. The front end that populates the program container is a
//! separate collaborator; everything from basic-block formation to the
//! finished NASM file lives here.

pub mod args;
pub mod codegen;

use codegen::X86Mode;
use ir::{Op, Width};
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Ir(#[from] ir::Error),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("{0} mode is not supported")]
    InvalidMode(X86Mode),
    #[error("width {width:?} of {name} does not fit {mode} mode")]
    InvalidWidth {
        name: String,
        width: Width,
        mode: X86Mode,
    },
    #[error("{0} has no width")]
    NoWidth(String),
    #[error("{0} has no computed size")]
    Unsized(String),
    #[error("the initialiser of {0} exceeds its storage")]
    OversizedInit(String),
    #[error("routine {0} has no instructions")]
    EmptyRoutine(String),
    #[error("routine {0} contains an empty block")]
    EmptyBlock(String),
    #[error("the {pass} cannot handle a {op} quad shaped like this")]
    UnknownOpcode { pass: &'static str, op: Op },
    #[error("internal: {0}")]
    Internal(String),
}

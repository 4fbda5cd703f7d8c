use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// The driver's command line.
#[derive(Parser, Debug)]
#[command(name = "mplc", version, about = "MPL back end: native assembler from portable program data")]
pub struct Args {
    /// Portable program data to compile.
    pub file: Option<PathBuf>,

    /// Generate for x86 long (64-bit) mode.
    #[arg(long = "x86-long")]
    pub x86_long: bool,

    /// Generate for x86 protected (32-bit) mode.
    #[arg(long = "x86-protected")]
    pub x86_protected: bool,

    /// Generate for ARMv7.
    #[arg(long = "arm-v7")]
    pub arm_v7: bool,

    /// Generate for ARMv8.
    #[arg(long = "arm-v8")]
    pub arm_v8: bool,

    /// Produce a portable executable instead of native assembler.
    #[arg(short = 'p', long = "portable")]
    pub portable: bool,

    /// Where to write the assembler file.
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Raise the diagnostic verbosity; may be repeated.
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Lower the diagnostic verbosity; may be repeated.
    #[arg(short = 'q', action = ArgAction::Count)]
    pub quiet: u8,

    /// Write a companion .dbg trace of the program container.
    #[arg(short = 'd', long = "debug-trace")]
    pub debug: bool,
}

impl Args {
    /// How many target architectures the command line picked.
    pub fn targets_given(&self) -> usize {
        [self.x86_long, self.x86_protected, self.arm_v7, self.arm_v8]
            .into_iter()
            .filter(|flag| *flag)
            .count()
    }
}

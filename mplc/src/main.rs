use clap::Parser;
use log::LevelFilter;
use mplc::args::Args;
use mplc::codegen::{self, X86Mode};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;

#[derive(Debug, Error)]
enum DriverError {
    #[error("exactly one target architecture may be selected")]
    TooManyTargets,
    #[error("the {0} writer is not wired into this build")]
    UnwiredTarget(&'static str),
    #[error(transparent)]
    Compile(#[from] mplc::Error),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("mplc: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Default chatter is warnings and up; every -v opens one level more,
/// every -q closes one.
fn init_logging(args: &Args) {
    let level = (2 + args.verbose as i32 - args.quiet as i32).clamp(0, 5);
    let filter = match level {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(filter)
        .format_timestamp(None)
        .init();
}

fn select_target(args: &Args) -> Result<X86Mode, DriverError> {
    if args.targets_given() > 1 {
        return Err(DriverError::TooManyTargets);
    }
    if args.portable {
        return Err(DriverError::UnwiredTarget("portable executable"));
    }
    if args.arm_v7 || args.arm_v8 {
        return Err(DriverError::UnwiredTarget("arm"));
    }
    if args.x86_protected {
        Ok(X86Mode::Protected)
    } else {
        if !args.x86_long {
            log::info!("no target selected, using x86 long mode");
        }
        Ok(X86Mode::Long)
    }
}

fn run(args: &Args) -> Result<(), DriverError> {
    let mode = select_target(args)?;

    // The language front end populates the container; it ships as its
    // own library. TODO: call into the parser here once it can read the
    // portable program files this driver accepts.
    let mut prog = ir::Ppd::new();
    if let Some(file) = &args.file {
        log::warn!(
            "no front end is linked into this build; {} was not read",
            file.display()
        );
    }

    let out_path = args.output.clone().unwrap_or_else(|| match &args.file {
        Some(file) => file.with_extension("asm"),
        None => PathBuf::from("out.asm"),
    });
    let mut out = File::create(&out_path)?;
    codegen::x86(&mut out, &mut prog, mode)?;

    if args.debug {
        let mut dbg = File::create(out_path.with_extension("dbg"))?;
        prog.dump(&mut dbg)?;
    }
    Ok(())
}

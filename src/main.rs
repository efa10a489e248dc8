//! Command-line front end for the `wisp` interpreter.
//!
//! Maps `wisp <source-path>` onto [`wisp::compile_and_run`] and translates the result into the
//! three exit codes the interpreter promises: `0` success, `1` source file missing or unreadable,
//! `2` any parse/emit/VM error.

mod cli;

use std::io;
use std::process::ExitCode;

use cli::Cli;
use log::error;

fn main() -> ExitCode {
    let args = Cli::init();

    simple_logger::init_with_level((&args.verbosity).into()).unwrap();

    if let Err(e) = std::fs::metadata(&args.source) {
        error!("could not read '{}': {e}", args.source.display());
        return ExitCode::from(1);
    }

    let mut stdout = io::stdout();
    match wisp::compile_and_run(&args.source, &mut stdout) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            error!("{e}");
            ExitCode::from(2)
        }
    }
}

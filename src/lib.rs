//! `wisp` — lexer, parser, bytecode emitter, and stack VM for the Wisp scripting language.
//!
//! [`compile_and_run`] is the whole pipeline in one call: parse an entry file (splicing its
//! `include`s), emit bytecode, and execute it. The three stages are also exposed individually
//! ([`parser::parse_entry_file`], [`emitter::emit`], [`vm::run`]) for callers that want to stop
//! partway, e.g. to print the AST or the compiled module.

pub mod ast;
pub mod emitter;
pub mod lexer;
pub mod parser;
pub mod token;
pub mod value;
pub mod vm;

use std::fmt::{self, Display};
use std::io::Write;
use std::path::Path;

pub use ast::Program;
pub use emitter::{emit, CgError, FunctionBc, Instr, ModuleBc};
pub use parser::{parse_entry_file, IncludeSet, ParseError, Parser};
pub use token::{Position, Token, TokenKind};
pub use value::Value;
pub use vm::{run, VmError};

/// Unifies the error types of every pipeline stage behind a single type, so that
/// [`compile_and_run`] and its callers can propagate with a plain `?`.
#[derive(Debug)]
pub enum Error {
    Parse(ParseError),
    Codegen(CgError),
    Runtime(VmError),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse(e) => write!(f, "{e}"),
            Error::Codegen(e) => write!(f, "{e}"),
            Error::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::Parse(e)
    }
}

impl From<CgError> for Error {
    fn from(e: CgError) -> Self {
        Error::Codegen(e)
    }
}

impl From<VmError> for Error {
    fn from(e: VmError) -> Self {
        Error::Runtime(e)
    }
}

/// Parses `path` (and anything it transitively `include`s), compiles the result to bytecode, and
/// runs it, writing everything `print` produces to `out`.
///
/// Whether `path` itself can be opened is the caller's concern (the CLI front end treats that
/// case separately, per its exit-code contract); a failure to read an `include`d file, in
/// contrast, surfaces here as an ordinary [`Error::Parse`].
pub fn compile_and_run(path: &Path, out: &mut dyn Write) -> Result<(), Error> {
    let program = parse_entry_file(path)?;
    let module = emit(&program)?;
    run(&module, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn compile_and_run_executes_a_source_file() {
        let path = std::env::temp_dir().join(format!("wisp-lib-test-{}.wisp", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "print(1 + 2);").unwrap();
        drop(file);

        let mut out = Vec::new();
        let result = compile_and_run(&path, &mut out);
        let _ = std::fs::remove_file(&path);

        assert!(result.is_ok());
        assert_eq!(String::from_utf8(out).unwrap(), "3\n");
    }

    #[test]
    fn missing_entry_file_is_a_parse_error() {
        let path = std::env::temp_dir().join("wisp-lib-test-does-not-exist.wisp");
        let mut out = Vec::new();
        assert!(matches!(compile_and_run(&path, &mut out), Err(Error::Parse(_))));
    }
}

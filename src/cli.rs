//! CLI argument parsing for the `wisp` interpreter.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Struct containing the CLI configuration for Wisp.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// The path to the wisp source file to run.
    #[arg(index = 1)]
    pub source: PathBuf,

    /// Specify the log level of the interpreter.
    #[arg(value_enum, short, long, default_value_t = LogLevel::default())]
    pub verbosity: LogLevel,
}

impl Cli {
    pub fn init() -> Self {
        Cli::parse()
    }
}

/// Enum for specifying the log level of Wisp.
#[derive(ValueEnum, Clone, Default, Debug)]
pub enum LogLevel {
    /// The default log level. Only critical errors will be logged.
    #[default]
    #[value(alias("0"))]
    Error,

    /// Also logs warnings, e.g. about redeclared globals.
    #[value(alias("1"))]
    Warn,

    /// Logs which file (and which includes) are being compiled.
    #[value(alias("2"))]
    Info,

    /// Logs codegen and VM internals.
    #[value(alias("3"))]
    Debug,

    /// Logs every token the lexer produces and every instruction the VM executes.
    #[value(alias("4"))]
    Trace,
}

impl From<&LogLevel> for log::Level {
    fn from(value: &LogLevel) -> Self {
        match value {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

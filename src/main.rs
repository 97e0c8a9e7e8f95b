use std::path::PathBuf;
use std::process;

use clap::error::ErrorKind;
use clap::Parser;

use raven::repl::repl;
use raven::{InterpretError, Vm};

/// The Raven language interpreter.
#[derive(Parser)]
#[command(name = "raven", version, about = "The Raven language interpreter")]
struct Cli {
    /// Script to execute; starts a REPL when omitted.
    file: Option<PathBuf>,
}

fn main() {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err)
            if err.kind() == ErrorKind::DisplayHelp
                || err.kind() == ErrorKind::DisplayVersion =>
        {
            let _ = err.print();
            return;
        }
        Err(_) => {
            eprintln!("Usage: raven [path]");
            process::exit(64);
        }
    };

    let mut vm = Vm::new();
    match cli.file {
        Some(path) => run_file(&mut vm, &path),
        None => repl(&mut vm),
    }
}

fn run_file(vm: &mut Vm, path: &PathBuf) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Could not open file \"{}\".", path.display());
            process::exit(74);
        }
    };

    match vm.interpret(&source) {
        Ok(()) => {}
        Err(InterpretError::Compile) => process::exit(65),
        Err(InterpretError::Runtime) => process::exit(70),
    }
}

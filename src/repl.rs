//! Interactive prompt: read a line, interpret it, repeat.

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::Vm;

pub fn repl(vm: &mut Vm) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Could not start REPL: {}", err);
            return;
        }
    };

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(&line);
                // Errors were already reported; the prompt just continues.
                let _ = vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("REPL error: {}", err);
                break;
            }
        }
    }
}

//! Built-in native functions: the global `clock`, and the member tables
//! consulted by the property protocol for strings, lists, dicts, and
//! options.
//!
//! Natives follow one contract: `fn(&mut Vm, arg_count, args_base) -> bool`.
//! The receiver of a bound native sits at `args_base - 1`. A native pushes
//! exactly one result and returns true, or reports through the VM's error
//! helpers and returns false.

mod dict;
mod list;
mod option;
mod string;

use super::object::{Heap, NativeFn, Obj};
use super::table::Table;
use super::value::Value;
use super::vm::Vm;

/// The member tables behind built-in receiver types.
pub struct Builtins {
    pub string_members: Table,
    pub list_members: Table,
    pub dict_members: Table,
    pub option_members: Table,
}

fn add_member(heap: &mut Heap, table: &mut Table, name: &str, native: NativeFn) {
    let name = heap.intern(name.as_bytes());
    let hash = heap.string(name).hash;
    let function = heap.allocate(Obj::Native(native));
    table.set(Value::obj(name), hash, Value::obj(function));
}

pub fn create_builtins(heap: &mut Heap) -> Builtins {
    let mut builtins = Builtins {
        string_members: Table::new(),
        list_members: Table::new(),
        dict_members: Table::new(),
        option_members: Table::new(),
    };

    add_member(heap, &mut builtins.string_members, "length", string::length);

    add_member(heap, &mut builtins.list_members, "append", list::append);
    add_member(heap, &mut builtins.list_members, "length", list::length);

    add_member(heap, &mut builtins.dict_members, "length", dict::length);

    add_member(heap, &mut builtins.option_members, "unwrap", option::unwrap);

    builtins
}

/// Install the global native functions.
pub fn define_globals(heap: &mut Heap, globals: &mut Table) {
    let name = heap.intern(b"clock");
    let hash = heap.string(name).hash;
    let function = heap.allocate(Obj::Native(clock));
    globals.set(Value::obj(name), hash, Value::obj(function));
}

/// Seconds since the interpreter started, as a number.
fn clock(vm: &mut Vm, arg_count: usize, _args_base: usize) -> bool {
    if !check_arg_count(vm, arg_count, 0) {
        return false;
    }
    let elapsed = vm.start.elapsed().as_secs_f64();
    vm.push(Value::number(elapsed)).is_ok()
}

/// Shared arity check; reports and returns false on mismatch.
pub(crate) fn check_arg_count(vm: &mut Vm, got: usize, expected: usize) -> bool {
    if got != expected {
        let message = format!("{} args expected but got {}.", expected, got);
        vm.runtime_error(&message);
        return false;
    }
    true
}

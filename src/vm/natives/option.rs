use super::check_arg_count;
use crate::vm::object::Obj;
use crate::vm::vm::Vm;

/// The value inside a full option; unwrapping `none` is a runtime error.
pub(super) fn unwrap(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, arg_count, 0) {
        return false;
    }
    let receiver = vm.stack[args_base - 1];
    let inner = match vm.heap.get(receiver.as_obj()) {
        Obj::Option(inner) => *inner,
        _ => unreachable!("option member bound to non-option"),
    };
    match inner {
        Some(value) => vm.push(value).is_ok(),
        None => {
            vm.runtime_error("Cannot unwrap 'none'.");
            false
        }
    }
}

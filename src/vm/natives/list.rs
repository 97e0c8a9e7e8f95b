use super::check_arg_count;
use crate::vm::object::Obj;
use crate::vm::value::Value;
use crate::vm::vm::Vm;

/// Append the argument and yield it back, so `xs.append(v)` is `v`.
pub(super) fn append(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, arg_count, 1) {
        return false;
    }
    let receiver = vm.stack[args_base - 1];
    let value = vm.stack[args_base];
    match vm.heap.get_mut(receiver.as_obj()) {
        Obj::List(values) => values.push(value),
        _ => unreachable!("list member bound to non-list"),
    }
    vm.heap.note_extra(std::mem::size_of::<Value>());
    vm.push(value).is_ok()
}

pub(super) fn length(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, arg_count, 0) {
        return false;
    }
    let receiver = vm.stack[args_base - 1];
    let len = match vm.heap.get(receiver.as_obj()) {
        Obj::List(values) => values.len(),
        _ => unreachable!("list member bound to non-list"),
    };
    vm.push(Value::number(len as f64)).is_ok()
}

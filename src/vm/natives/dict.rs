use super::check_arg_count;
use crate::vm::object::Obj;
use crate::vm::value::Value;
use crate::vm::vm::Vm;

pub(super) fn length(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, arg_count, 0) {
        return false;
    }
    let receiver = vm.stack[args_base - 1];
    let len = match vm.heap.get(receiver.as_obj()) {
        Obj::Dict(table) => table.len(),
        _ => unreachable!("dict member bound to non-dict"),
    };
    vm.push(Value::number(len as f64)).is_ok()
}

//! Output builtins, routed through the VM's `PrintWriter`.

use crate::{
    errors::{BuiltinCode, EvalResult, throw},
    value::Value,
    vm::Vm,
};

pub(crate) fn install(vm: &mut Vm) {
    let installed: Result<(), crate::errors::Error> = (|| {
        vm.defun("print", bi_print, None)?;
        vm.defun("put", bi_put, None)?;
        Ok(())
    })();
    installed.expect("installing print builtins cannot fail");
}

/// `(print v)`: display form plus a newline.
fn bi_print(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [value] = args else {
        return Err(throw(BuiltinCode::Evalue, "print takes one argument"));
    };
    let mut text = vm.display(*value);
    text.push('\n');
    vm.writer.stdout_write(&text)?;
    Ok(Value::Nil)
}

/// `(put v)`: display form, no newline.
fn bi_put(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [value] = args else {
        return Err(throw(BuiltinCode::Evalue, "put takes one argument"));
    };
    let text = vm.display(*value);
    vm.writer.stdout_write(&text)?;
    Ok(Value::Nil)
}

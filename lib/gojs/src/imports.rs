//! The `go` import namespace.
//!
//! Every import takes the guest stack pointer and works on the frame
//! layout fixed by the foreign ABI. Host state lives in a [`GoEnv`]
//! shared by all imports through the function environment; calls that
//! complete a guest callback stage the event and re-enter the guest's
//! `resume` export before storing their own result, re-reading the stack
//! pointer afterwards since the guest may have moved it.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use wasmer::{
    imports, Function, FunctionEnv, FunctionEnvMut, Imports, Memory, MemoryView, RuntimeError,
    Store,
};

use crate::abi;
use crate::host::Dispatch;
use crate::values::JsRef;
use crate::{GoEnv, RunnerError};

pub(crate) const DEADLINE_TRAP: &str = "goscript-gojs deadline exceeded";

fn rt(err: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::new(err.to_string())
}

fn check_deadline(env: &FunctionEnvMut<GoEnv>) -> Result<(), RuntimeError> {
    if let Some(deadline) = env.data().deadline {
        if Instant::now() >= deadline {
            return Err(RuntimeError::new(DEADLINE_TRAP));
        }
    }
    Ok(())
}

fn memory(env: &FunctionEnvMut<GoEnv>) -> Result<Memory, RuntimeError> {
    env.data()
        .memory
        .clone()
        .ok_or_else(|| RuntimeError::new("guest memory is not attached"))
}

/// Re-read the stack pointer after any call that may have re-entered the
/// guest.
fn refresh_sp(env: &mut FunctionEnvMut<GoEnv>) -> Result<i32, RuntimeError> {
    let getsp = env
        .data()
        .getsp
        .clone()
        .ok_or_else(|| RuntimeError::new("getsp export is not attached"))?;
    getsp.call(env)
}

fn load_value(env: &FunctionEnvMut<GoEnv>, view: &MemoryView, at: u64) -> Result<JsRef, RuntimeError> {
    let bits = abi::get_u64(view, at).map_err(rt)?;
    Ok(env.data().host.heap.load(bits))
}

fn store_value(
    env: &mut FunctionEnvMut<GoEnv>,
    memory: &Memory,
    at: u64,
    value: JsRef,
) -> Result<(), RuntimeError> {
    let bits = env.data_mut().host.heap.store(value);
    let view = memory.view(&*env);
    abi::set_u64(&view, at, bits).map_err(rt)
}

/// Read a `[]js.Value` argument vector.
fn load_ref_slice(
    env: &FunctionEnvMut<GoEnv>,
    view: &MemoryView,
    at: u64,
) -> Result<Vec<JsRef>, RuntimeError> {
    let (ptr, len) = abi::load_slice_desc(view, at).map_err(rt)?;
    let mut refs = Vec::with_capacity(len as usize);
    for i in 0..len {
        refs.push(load_value(env, view, ptr + i * 8)?);
    }
    Ok(refs)
}

/// Resolve a dispatch outcome, driving the callback protocol when the
/// call completed through a guest callback.
fn finish_dispatch(
    env: &mut FunctionEnvMut<GoEnv>,
    dispatch: Dispatch,
) -> Result<Result<JsRef, JsRef>, RuntimeError> {
    match dispatch {
        Dispatch::Value(value) => Ok(Ok(value)),
        Dispatch::Error(err) => Ok(Err(err)),
        Dispatch::Callback { func, args, ret } => {
            env.data_mut().host.queue_event(func, args);
            let resume = env
                .data()
                .resume
                .clone()
                .ok_or_else(|| RuntimeError::new("resume export is not attached"))?;
            resume.call(env, &[])?;
            Ok(Ok(ret))
        }
    }
}

// ---- runtime.* ----

fn debug(_env: FunctionEnvMut<GoEnv>, value: i32) {
    tracing::debug!(value, "guest debug");
}

fn wasm_exit(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let code = {
        let view = memory.view(&env);
        abi::get_i32(&view, abi::addr(sp, 8)).map_err(rt)?
    };
    tracing::debug!(code, "guest exit");
    let data = env.data_mut();
    data.exited = true;
    data.exit_code = code;
    Ok(())
}

fn wasm_write(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let (fd, bytes) = {
        let view = memory.view(&env);
        let fd = abi::get_i64(&view, abi::addr(sp, 8)).map_err(rt)?;
        let ptr = abi::get_i64(&view, abi::addr(sp, 16)).map_err(rt)? as u64;
        let len = abi::get_i32(&view, abi::addr(sp, 24)).map_err(rt)? as usize;
        let mut buf = vec![0u8; len];
        view.read(ptr, &mut buf).map_err(rt)?;
        (fd, buf)
    };
    if let Err(e) = env.data_mut().host.fs.write_sync(fd as u32, &bytes) {
        tracing::warn!(fd, error = %e, "wasmWrite to unknown descriptor dropped");
    }
    Ok(())
}

fn reset_memory_data_view(_env: FunctionEnvMut<GoEnv>, _sp: i32) {
    // Views are re-derived on every host access, so growth needs no action.
}

fn nanotime1(env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    check_deadline(&env)?;
    let memory = memory(&env)?;
    let nanos = env.data().start.elapsed().as_nanos() as i64;
    let view = memory.view(&env);
    abi::set_i64(&view, abi::addr(sp, 8), nanos).map_err(rt)
}

fn walltime(env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let view = memory.view(&env);
    abi::set_i64(&view, abi::addr(sp, 8), now.as_secs() as i64).map_err(rt)?;
    abi::set_i32(&view, abi::addr(sp, 16), now.subsec_nanos() as i32).map_err(rt)
}

fn schedule_timeout_event(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    check_deadline(&env)?;
    let memory = memory(&env)?;
    let millis = {
        let view = memory.view(&env);
        abi::get_i64(&view, abi::addr(sp, 8)).map_err(rt)?
    };
    let id = {
        let data = env.data_mut();
        let id = data.next_timeout_id;
        data.next_timeout_id += 1;
        let due = Instant::now() + Duration::from_millis(millis.max(0) as u64);
        data.timeouts.insert(id, due);
        id
    };
    let view = memory.view(&env);
    abi::set_i32(&view, abi::addr(sp, 16), id).map_err(rt)
}

fn clear_timeout_event(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let id = {
        let view = memory.view(&env);
        abi::get_i32(&view, abi::addr(sp, 8)).map_err(rt)?
    };
    env.data_mut().timeouts.remove(&id);
    Ok(())
}

fn get_random_data(env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let view = memory.view(&env);
    let (ptr, len) = abi::load_slice_desc(&view, abi::addr(sp, 8)).map_err(rt)?;
    let mut buf = vec![0u8; len as usize];
    rand::thread_rng().fill_bytes(&mut buf);
    view.write(ptr, &buf).map_err(rt)
}

// ---- syscall/js.* ----

fn finalize_ref(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let id = {
        let view = memory.view(&env);
        abi::get_u32(&view, abi::addr(sp, 8)).map_err(rt)?
    };
    env.data_mut().host.heap.finalize(id);
    Ok(())
}

fn string_val(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let text = {
        let view = memory.view(&env);
        abi::load_string(&view, abi::addr(sp, 8)).map_err(rt)?
    };
    let value = env.data_mut().host.string_ref(text);
    store_value(&mut env, &memory, abi::addr(sp, 24), value)
}

fn value_get(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    check_deadline(&env)?;
    let memory = memory(&env)?;
    let (target, key) = {
        let view = memory.view(&env);
        let target = load_value(&env, &view, abi::addr(sp, 8))?;
        let key = abi::load_string(&view, abi::addr(sp, 16)).map_err(rt)?;
        (target, key)
    };
    let result = env.data_mut().host.reflect_get(target, &key);
    let sp = refresh_sp(&mut env)?;
    store_value(&mut env, &memory, abi::addr(sp, 32), result)
}

fn value_set(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let (target, key, value) = {
        let view = memory.view(&env);
        let target = load_value(&env, &view, abi::addr(sp, 8))?;
        let key = abi::load_string(&view, abi::addr(sp, 16)).map_err(rt)?;
        let value = load_value(&env, &view, abi::addr(sp, 32))?;
        (target, key, value)
    };
    env.data_mut().host.reflect_set(target, &key, value);
    Ok(())
}

fn value_delete(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let (target, key) = {
        let view = memory.view(&env);
        let target = load_value(&env, &view, abi::addr(sp, 8))?;
        let key = abi::load_string(&view, abi::addr(sp, 16)).map_err(rt)?;
        (target, key)
    };
    env.data_mut().host.reflect_delete(target, &key);
    Ok(())
}

fn value_index(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let (target, index) = {
        let view = memory.view(&env);
        let target = load_value(&env, &view, abi::addr(sp, 8))?;
        let index = abi::get_i64(&view, abi::addr(sp, 16)).map_err(rt)?;
        (target, index)
    };
    let result = env.data().host.index(target, index);
    store_value(&mut env, &memory, abi::addr(sp, 24), result)
}

fn value_set_index(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let (target, index, value) = {
        let view = memory.view(&env);
        let target = load_value(&env, &view, abi::addr(sp, 8))?;
        let index = abi::get_i64(&view, abi::addr(sp, 16)).map_err(rt)?;
        let value = load_value(&env, &view, abi::addr(sp, 24))?;
        (target, index, value)
    };
    env.data_mut().host.set_index(target, index, value);
    Ok(())
}

fn value_call(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    check_deadline(&env)?;
    let memory = memory(&env)?;
    let (target, method, args) = {
        let view = memory.view(&env);
        let target = load_value(&env, &view, abi::addr(sp, 8))?;
        let method = abi::load_string(&view, abi::addr(sp, 16)).map_err(rt)?;
        let args = load_ref_slice(&env, &view, abi::addr(sp, 32))?;
        (target, method, args)
    };
    tracing::trace!(method = %method, "valueCall");
    let dispatch = env.data_mut().host.call(target, &method, args);
    let result = finish_dispatch(&mut env, dispatch)?;
    let sp = refresh_sp(&mut env)?;
    match result {
        Ok(value) => {
            store_value(&mut env, &memory, abi::addr(sp, 56), value)?;
            let view = memory.view(&env);
            abi::set_u8(&view, abi::addr(sp, 64), 1).map_err(rt)
        }
        Err(err) => {
            store_value(&mut env, &memory, abi::addr(sp, 56), err)?;
            let view = memory.view(&env);
            abi::set_u8(&view, abi::addr(sp, 64), 0).map_err(rt)
        }
    }
}

fn value_invoke(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    check_deadline(&env)?;
    let memory = memory(&env)?;
    let (target, args) = {
        let view = memory.view(&env);
        let target = load_value(&env, &view, abi::addr(sp, 8))?;
        let args = load_ref_slice(&env, &view, abi::addr(sp, 16))?;
        (target, args)
    };
    let dispatch = env.data_mut().host.invoke(target, args);
    let result = finish_dispatch(&mut env, dispatch)?;
    let sp = refresh_sp(&mut env)?;
    match result {
        Ok(value) => {
            store_value(&mut env, &memory, abi::addr(sp, 40), value)?;
            let view = memory.view(&env);
            abi::set_u8(&view, abi::addr(sp, 48), 1).map_err(rt)
        }
        Err(err) => {
            store_value(&mut env, &memory, abi::addr(sp, 40), err)?;
            let view = memory.view(&env);
            abi::set_u8(&view, abi::addr(sp, 48), 0).map_err(rt)
        }
    }
}

fn value_new(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let (target, args) = {
        let view = memory.view(&env);
        let target = load_value(&env, &view, abi::addr(sp, 8))?;
        let args = load_ref_slice(&env, &view, abi::addr(sp, 16))?;
        (target, args)
    };
    let dispatch = env.data_mut().host.construct(target, args);
    let result = finish_dispatch(&mut env, dispatch)?;
    let sp = refresh_sp(&mut env)?;
    match result {
        Ok(value) => {
            store_value(&mut env, &memory, abi::addr(sp, 40), value)?;
            let view = memory.view(&env);
            abi::set_u8(&view, abi::addr(sp, 48), 1).map_err(rt)
        }
        Err(err) => {
            store_value(&mut env, &memory, abi::addr(sp, 40), err)?;
            let view = memory.view(&env);
            abi::set_u8(&view, abi::addr(sp, 48), 0).map_err(rt)
        }
    }
}

fn value_length(env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let target = {
        let view = memory.view(&env);
        load_value(&env, &view, abi::addr(sp, 8))?
    };
    let length = env.data().host.length(target);
    let view = memory.view(&env);
    abi::set_i64(&view, abi::addr(sp, 16), length).map_err(rt)
}

fn value_prepare_string(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let target = {
        let view = memory.view(&env);
        load_value(&env, &view, abi::addr(sp, 8))?
    };
    let text = env.data().host.stringify(target);
    let length = text.len() as i64;
    let prepared = env.data_mut().host.string_ref(text);
    store_value(&mut env, &memory, abi::addr(sp, 16), prepared)?;
    let view = memory.view(&env);
    abi::set_i64(&view, abi::addr(sp, 24), length).map_err(rt)
}

fn value_load_string(env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let view = memory.view(&env);
    let target = load_value(&env, &view, abi::addr(sp, 8))?;
    let Some(text) = env.data().host.js_string(target) else {
        return Err(RuntimeError::new("valueLoadString on a non-string"));
    };
    let (ptr, len) = abi::load_slice_desc(&view, abi::addr(sp, 16)).map_err(rt)?;
    let n = (len as usize).min(text.len());
    view.write(ptr, &text.as_bytes()[..n]).map_err(rt)
}

fn value_instance_of(env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let view = memory.view(&env);
    let value = load_value(&env, &view, abi::addr(sp, 8))?;
    let ctor = load_value(&env, &view, abi::addr(sp, 16))?;
    let result = env.data().host.instance_of(value, ctor);
    abi::set_u8(&view, abi::addr(sp, 24), result as u8).map_err(rt)
}

fn copy_bytes_to_go(env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let view = memory.view(&env);
    let (ptr, dst_len) = abi::load_slice_desc(&view, abi::addr(sp, 8)).map_err(rt)?;
    let src = load_value(&env, &view, abi::addr(sp, 32))?;

    let bytes = src
        .as_id()
        .and_then(|id| match env.data().host.heap.get(id) {
            Some(crate::values::Value::Bytes(b)) => Some(b.clone()),
            _ => None,
        });
    match bytes {
        Some(bytes) => {
            let n = bytes.len().min(dst_len as usize);
            view.write(ptr, &bytes[..n]).map_err(rt)?;
            abi::set_i64(&view, abi::addr(sp, 40), n as i64).map_err(rt)?;
            abi::set_u8(&view, abi::addr(sp, 48), 1).map_err(rt)
        }
        None => abi::set_u8(&view, abi::addr(sp, 48), 0).map_err(rt),
    }
}

fn copy_bytes_to_js(mut env: FunctionEnvMut<GoEnv>, sp: i32) -> Result<(), RuntimeError> {
    let memory = memory(&env)?;
    let (dst, src) = {
        let view = memory.view(&env);
        let dst = load_value(&env, &view, abi::addr(sp, 8))?;
        let (ptr, len) = abi::load_slice_desc(&view, abi::addr(sp, 16)).map_err(rt)?;
        let mut buf = vec![0u8; len as usize];
        view.read(ptr, &mut buf).map_err(rt)?;
        (dst, buf)
    };

    let copied = dst.as_id().and_then(|id| {
        match env.data_mut().host.heap.get_mut(id) {
            Some(crate::values::Value::Bytes(bytes)) => {
                let n = bytes.len().min(src.len());
                bytes[..n].copy_from_slice(&src[..n]);
                Some(n)
            }
            _ => None,
        }
    });
    let view = memory.view(&env);
    match copied {
        Some(n) => {
            abi::set_i64(&view, abi::addr(sp, 40), n as i64).map_err(rt)?;
            abi::set_u8(&view, abi::addr(sp, 48), 1).map_err(rt)
        }
        None => abi::set_u8(&view, abi::addr(sp, 48), 0).map_err(rt),
    }
}

/// The complete import object for one instance.
pub(crate) fn build_imports(store: &mut Store, env: &FunctionEnv<GoEnv>) -> Imports {
    imports! {
        "go" => {
            "debug" => Function::new_typed_with_env(store, env, debug),
            "runtime.wasmExit" => Function::new_typed_with_env(store, env, wasm_exit),
            "runtime.wasmWrite" => Function::new_typed_with_env(store, env, wasm_write),
            "runtime.resetMemoryDataView" => Function::new_typed_with_env(store, env, reset_memory_data_view),
            "runtime.nanotime1" => Function::new_typed_with_env(store, env, nanotime1),
            "runtime.walltime" => Function::new_typed_with_env(store, env, walltime),
            "runtime.scheduleTimeoutEvent" => Function::new_typed_with_env(store, env, schedule_timeout_event),
            "runtime.clearTimeoutEvent" => Function::new_typed_with_env(store, env, clear_timeout_event),
            "runtime.getRandomData" => Function::new_typed_with_env(store, env, get_random_data),
            "syscall/js.finalizeRef" => Function::new_typed_with_env(store, env, finalize_ref),
            "syscall/js.stringVal" => Function::new_typed_with_env(store, env, string_val),
            "syscall/js.valueGet" => Function::new_typed_with_env(store, env, value_get),
            "syscall/js.valueSet" => Function::new_typed_with_env(store, env, value_set),
            "syscall/js.valueDelete" => Function::new_typed_with_env(store, env, value_delete),
            "syscall/js.valueIndex" => Function::new_typed_with_env(store, env, value_index),
            "syscall/js.valueSetIndex" => Function::new_typed_with_env(store, env, value_set_index),
            "syscall/js.valueCall" => Function::new_typed_with_env(store, env, value_call),
            "syscall/js.valueInvoke" => Function::new_typed_with_env(store, env, value_invoke),
            "syscall/js.valueNew" => Function::new_typed_with_env(store, env, value_new),
            "syscall/js.valueLength" => Function::new_typed_with_env(store, env, value_length),
            "syscall/js.valuePrepareString" => Function::new_typed_with_env(store, env, value_prepare_string),
            "syscall/js.valueLoadString" => Function::new_typed_with_env(store, env, value_load_string),
            "syscall/js.valueInstanceOf" => Function::new_typed_with_env(store, env, value_instance_of),
            "syscall/js.copyBytesToGo" => Function::new_typed_with_env(store, env, copy_bytes_to_go),
            "syscall/js.copyBytesToJS" => Function::new_typed_with_env(store, env, copy_bytes_to_js),
        },
    }
}

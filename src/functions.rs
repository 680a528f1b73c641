//! Host callback registration and the sync-path dispatch that backs it.
//!
//! A registered name gets one Rhai overload per arity up to the declared
//! maximum (0..=10), since Rhai resolves functions by name *and* arity.
//! Every overload funnels into [`dispatch_callback`], which picks the sync
//! or async route based on the calling thread's [`IN_ASYNC_EVAL`] flag.

use std::cell::Cell;
use std::ffi::{c_char, CStr, CString};
use std::sync::Mutex;

use rhai::{Dynamic, Engine, EvalAltResult};

use crate::error::{clear_last_error, set_last_error, CoreError};
use crate::types::{CRhaiEngine, CallbackEntry};
use crate::values::{decode_value, encode_args};
use crate::catch_panic;

/// Sync-path trampoline into the host: `(callback_id, encoded_args) -> encoded_response`.
pub type HostInvoker = extern "C" fn(u64, *const c_char) -> *mut c_char;
/// Releases a string previously returned by [`HostInvoker`].
pub type FreeHostString = extern "C" fn(*mut c_char);

struct HostBinding {
    invoke: HostInvoker,
    free_string: FreeHostString,
}

lazy_static::lazy_static! {
    static ref HOST_BINDING: Mutex<Option<HostBinding>> = Mutex::new(None);
}

thread_local! {
    static IN_ASYNC_EVAL: Cell<bool> = const { Cell::new(false) };
    static ASYNC_DETECTED: Cell<bool> = const { Cell::new(false) };
}

/// Set at the entry/exit of the sync `rhai_eval` call and of an async
/// worker's evaluation loop. Nothing else should touch this.
pub(crate) fn set_async_eval_mode(active: bool) {
    IN_ASYNC_EVAL.with(|flag| flag.set(active));
}

fn is_async_eval() -> bool {
    IN_ASYNC_EVAL.with(|flag| flag.get())
}

fn mark_async_detected() {
    ASYNC_DETECTED.with(|flag| flag.set(true));
}

/// Consumes the "an async host function was invoked on the sync path" flag.
pub(crate) fn take_async_detected() -> bool {
    ASYNC_DETECTED.with(|flag| flag.replace(false))
}

/// Resets the "an async host function was invoked on the sync path" flag.
///
/// Must run before every evaluation, not only after a failed one: a script
/// that invokes a pending async callback inside `try`/`catch` and recovers
/// leaves the flag set even though the call that raised it succeeded, which
/// would otherwise bleed into the next unrelated failure on the same thread.
pub(crate) fn clear_async_detected() {
    ASYNC_DETECTED.with(|flag| flag.set(false));
}

/// Registers the process-wide sync-path invoker and its matching string
/// deallocator. Must be called once before any sync-path callback fires.
#[no_mangle]
pub extern "C" fn rhai_set_host_invoker(invoke: HostInvoker, free_string: FreeHostString) -> i32 {
    catch_panic! {{
        clear_last_error();
        *HOST_BINDING.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some(HostBinding { invoke, free_string });
        0
    }}
}

#[no_mangle]
pub extern "C" fn rhai_register_function(
    engine: *mut CRhaiEngine,
    name: *const c_char,
    callback_id: u64,
    arity: u8,
) -> i32 {
    catch_panic! {{
        clear_last_error();
        match register_function_impl(engine, name, callback_id, arity) {
            Ok(()) => 0,
            Err(err) => {
                set_last_error(&err);
                -1
            }
        }
    }}
}

fn register_function_impl(
    engine: *mut CRhaiEngine,
    name: *const c_char,
    callback_id: u64,
    arity: u8,
) -> Result<(), CoreError> {
    if engine.is_null() {
        return Err(CoreError::ffi("engine pointer is null"));
    }
    if name.is_null() {
        return Err(CoreError::ffi("function name pointer is null"));
    }
    let name = unsafe { CStr::from_ptr(name) }
        .to_str()
        .map_err(|e| CoreError::ffi(format!("invalid utf-8 in function name: {e}")))?
        .to_string();
    let arity = arity.min(10);

    let handle = unsafe { &*engine };
    handle.with_inner(|inner| {
        inner.callbacks.insert(
            name.clone(),
            CallbackEntry {
                id: callback_id,
                arity,
                name: name.clone(),
            },
        );
        register_overloads(&mut inner.engine, &name, callback_id, arity);
        tracing::debug!(name, callback_id, arity, "registered host callback");
        Ok(())
    })
}

/// Installs one Rhai overload per arity, 0..=10, unconditionally — every call
/// re-registers all eleven, not only the ones up to `arity`. Rhai's function
/// table is keyed by name *and* arity: if a prior registration of this name
/// declared a larger arity, the overloads it installed above the new
/// ceiling would otherwise keep closing over the old `callback_id` forever,
/// since nothing would overwrite them. Each overload still enforces the
/// declared ceiling at call time, not at registration time.
fn register_overloads(engine: &mut Engine, name: &str, callback_id: u64, arity: u8) {
    macro_rules! overload {
        ($this_arity:literal $(, $arg:ident)*) => {{
            let fn_name = name.to_string();
            let declared_arity = arity;
            engine.register_fn(name, move |$($arg: Dynamic),*| -> Result<Dynamic, Box<EvalAltResult>> {
                if $this_arity > declared_arity {
                    return Err(format!(
                        "no callback registered for {fn_name} with {} argument(s)",
                        $this_arity
                    )
                    .into());
                }
                dispatch_callback(callback_id, &fn_name, vec![$($arg),*])
            });
        }};
    }

    overload!(0);
    overload!(1, a1);
    overload!(2, a1, a2);
    overload!(3, a1, a2, a3);
    overload!(4, a1, a2, a3, a4);
    overload!(5, a1, a2, a3, a4, a5);
    overload!(6, a1, a2, a3, a4, a5, a6);
    overload!(7, a1, a2, a3, a4, a5, a6, a7);
    overload!(8, a1, a2, a3, a4, a5, a6, a7, a8);
    overload!(9, a1, a2, a3, a4, a5, a6, a7, a8, a9);
    overload!(10, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10);
}

fn dispatch_callback(
    callback_id: u64,
    name: &str,
    args: Vec<Dynamic>,
) -> Result<Dynamic, Box<EvalAltResult>> {
    let result = if is_async_eval() {
        crate::async_eval::dispatch_async(callback_id, &args)
    } else {
        dispatch_sync(callback_id, &args)
    };
    result.map_err(|err| {
        tracing::warn!(name, callback_id, error = %err, "callback dispatch failed");
        err.detail().to_string().into()
    })
}

fn dispatch_sync(callback_id: u64, args: &[Dynamic]) -> Result<Dynamic, CoreError> {
    let encoded_args = encode_args(args)?;
    let guard = HOST_BINDING
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let binding = guard
        .as_ref()
        .ok_or_else(|| CoreError::ffi("no host invoker registered"))?;
    let args_c = CString::new(encoded_args)
        .map_err(|e| CoreError::ffi(format!("embedded NUL in encoded args: {e}")))?;

    let result_ptr = (binding.invoke)(callback_id, args_c.as_ptr());
    if result_ptr.is_null() {
        return Err(CoreError::ffi("host invoker returned null"));
    }
    let response = unsafe { CStr::from_ptr(result_ptr) }
        .to_str()
        .map(str::to_string);
    (binding.free_string)(result_ptr);
    let response =
        response.map_err(|e| CoreError::ffi(format!("invalid utf-8 in host response: {e}")))?;

    parse_sync_response(&response)
}

fn parse_sync_response(response: &str) -> Result<Dynamic, CoreError> {
    let value: serde_json::Value = serde_json::from_str(response)
        .map_err(|e| CoreError::ffi(format!("malformed host response: {e}")))?;
    let status = value
        .get("status")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::ffi("host response missing status"))?;

    match status {
        "success" => {
            let encoded = value
                .get("value")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            decode_value(&encoded.to_string())
        }
        "pending" => {
            mark_async_detected();
            Err(CoreError::runtime(
                "Async function detected. Use evalAsync() to call async functions.",
            ))
        }
        "error" => {
            let message = value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown host error");
            Err(CoreError::runtime(message))
        }
        other => Err(CoreError::ffi(format!("unknown host response status: {other}"))),
    }
}

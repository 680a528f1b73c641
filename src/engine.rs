//! Engine lifecycle: creation from config, disposal, evaluation, static
//! analysis, and default-scope management.

use std::ffi::{c_char, CStr, CString};
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, Scope};
use serde::Serialize;

use crate::async_eval::{clear_deadline, deadline_exceeded, dispose_tickets_for_engine, set_deadline};
use crate::error::{clear_last_error, set_last_error, CoreError};
use crate::functions::{clear_async_detected, set_async_eval_mode, take_async_detected};
use crate::types::{CRhaiConfig, CRhaiEngine, EngineConfig, EngineInner};
use crate::values::{decode_value, encode_value};
use crate::{catch_panic, catch_panic_ptr};

fn build_engine(config: &EngineConfig) -> Engine {
    let mut engine = Engine::new();

    if let Some(max_ops) = config.max_operations {
        engine.set_max_operations(max_ops);
    }
    if let Some(max_depth) = config.max_stack_depth {
        engine.set_max_call_levels(max_depth as usize);
    }
    if let Some(max_len) = config.max_string_length {
        engine.set_max_string_size(max_len as usize);
    }
    if config.disable_file_io {
        engine.on_print(|_| {});
        engine.on_debug(|_, _, _| {});
    }
    if config.disable_eval {
        engine.disable_symbol("eval");
    }
    if config.disable_modules {
        engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    }
    engine.on_progress(|_ops| {
        if deadline_exceeded() {
            Some(Dynamic::from("evaluation timed out"))
        } else {
            None
        }
    });

    engine
}

#[no_mangle]
pub extern "C" fn rhai_engine_new(config: *const CRhaiConfig) -> *mut CRhaiEngine {
    catch_panic_ptr! {{
        clear_last_error();
        let engine_config = if config.is_null() {
            EngineConfig::secure_defaults()
        } else {
            EngineConfig::from_c_config(unsafe { &*config })
        };

        let engine = build_engine(&engine_config);
        let inner = EngineInner::new(engine, engine_config);
        tracing::debug!("engine created");
        Box::into_raw(Box::new(CRhaiEngine::new(inner)))
    }}
}

#[no_mangle]
pub extern "C" fn rhai_engine_free(engine: *mut CRhaiEngine) {
    if engine.is_null() {
        return;
    }
    let handle = unsafe { &*engine };
    handle.dispose();
    dispose_tickets_for_engine(engine as usize);
    tracing::debug!("engine disposed");
}

#[no_mangle]
pub extern "C" fn rhai_eval(
    engine: *mut CRhaiEngine,
    script: *const c_char,
    out_encoded: *mut *mut c_char,
) -> i32 {
    catch_panic! {{
        clear_last_error();
        match eval_impl(engine, script, out_encoded) {
            Ok(()) => 0,
            Err(err) => {
                tracing::warn!(error = %err, "eval failed");
                set_last_error(&err);
                -1
            }
        }
    }}
}

fn eval_impl(
    engine: *mut CRhaiEngine,
    script: *const c_char,
    out_encoded: *mut *mut c_char,
) -> Result<(), CoreError> {
    if engine.is_null() {
        return Err(CoreError::ffi("engine pointer is null"));
    }
    if script.is_null() {
        return Err(CoreError::ffi("script pointer is null"));
    }
    if out_encoded.is_null() {
        return Err(CoreError::ffi("output pointer is null"));
    }

    let script = unsafe { CStr::from_ptr(script) }
        .to_str()
        .map_err(|e| CoreError::ffi(format!("invalid utf-8 in script: {e}")))?;

    let handle = unsafe { &*engine };
    clear_async_detected();
    let result = handle.with_inner(|inner| {
        let timeout_ms = inner.config.timeout_ms;
        set_async_eval_mode(false);
        set_deadline(timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms)));
        let eval_result = inner
            .engine
            .eval_with_scope::<Dynamic>(&mut inner.scope, script)
            .map_err(CoreError::from);
        clear_deadline();
        eval_result
    });

    let value = match result {
        Ok(value) => value,
        Err(err) => {
            if take_async_detected() {
                return Err(CoreError::runtime(
                    "Async function detected. Use evalAsync() to call async functions.",
                ));
            }
            return Err(err);
        }
    };

    let encoded = encode_value(&value)?;
    let c_string = CString::new(encoded)
        .map_err(|e| CoreError::ffi(format!("embedded NUL in result: {e}")))?;
    unsafe {
        *out_encoded = c_string.into_raw();
    }
    Ok(())
}

/// `rhai_analyze` result, encoded as JSON for the host.
#[derive(Serialize)]
struct AnalysisResult {
    valid: bool,
    syntax_errors: Vec<String>,
    warnings: Vec<String>,
}

impl AnalysisResult {
    fn valid() -> Self {
        Self {
            valid: true,
            syntax_errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn invalid(message: String) -> Self {
        Self {
            valid: false,
            syntax_errors: vec![message],
            warnings: Vec::new(),
        }
    }
}

#[no_mangle]
pub extern "C" fn rhai_analyze(
    engine: *mut CRhaiEngine,
    script: *const c_char,
    out_encoded: *mut *mut c_char,
) -> i32 {
    catch_panic! {{
        clear_last_error();
        match analyze_impl(engine, script, out_encoded) {
            Ok(()) => 0,
            Err(err) => {
                set_last_error(&err);
                -1
            }
        }
    }}
}

fn analyze_impl(
    engine: *mut CRhaiEngine,
    script: *const c_char,
    out_encoded: *mut *mut c_char,
) -> Result<(), CoreError> {
    if engine.is_null() {
        return Err(CoreError::ffi("engine pointer is null"));
    }
    if script.is_null() {
        return Err(CoreError::ffi("script pointer is null"));
    }
    if out_encoded.is_null() {
        return Err(CoreError::ffi("output pointer is null"));
    }

    let script = unsafe { CStr::from_ptr(script) }
        .to_str()
        .map_err(|e| CoreError::ffi(format!("invalid utf-8 in script: {e}")))?;

    let handle = unsafe { &*engine };
    let analysis = handle.with_inner(|inner| {
        Ok(match inner.engine.compile(script) {
            Ok(_) => AnalysisResult::valid(),
            Err(err) => AnalysisResult::invalid(CoreError::from(err).to_string()),
        })
    })?;

    let encoded = serde_json::to_string(&analysis)
        .map_err(|e| CoreError::ffi(format!("failed to encode analysis result: {e}")))?;
    let c_string = CString::new(encoded)
        .map_err(|e| CoreError::ffi(format!("embedded NUL in result: {e}")))?;
    unsafe {
        *out_encoded = c_string.into_raw();
    }
    Ok(())
}

#[no_mangle]
pub extern "C" fn rhai_set_var(
    engine: *mut CRhaiEngine,
    name: *const c_char,
    encoded_value: *const c_char,
) -> i32 {
    catch_panic! {{
        clear_last_error();
        match set_scope_value(engine, name, encoded_value, false) {
            Ok(()) => 0,
            Err(err) => {
                set_last_error(&err);
                -1
            }
        }
    }}
}

#[no_mangle]
pub extern "C" fn rhai_set_constant(
    engine: *mut CRhaiEngine,
    name: *const c_char,
    encoded_value: *const c_char,
) -> i32 {
    catch_panic! {{
        clear_last_error();
        match set_scope_value(engine, name, encoded_value, true) {
            Ok(()) => 0,
            Err(err) => {
                set_last_error(&err);
                -1
            }
        }
    }}
}

fn set_scope_value(
    engine: *mut CRhaiEngine,
    name: *const c_char,
    encoded_value: *const c_char,
    constant: bool,
) -> Result<(), CoreError> {
    if engine.is_null() {
        return Err(CoreError::ffi("engine pointer is null"));
    }
    if name.is_null() {
        return Err(CoreError::ffi("name pointer is null"));
    }
    if encoded_value.is_null() {
        return Err(CoreError::ffi("value pointer is null"));
    }

    let name = unsafe { CStr::from_ptr(name) }
        .to_str()
        .map_err(|e| CoreError::ffi(format!("invalid utf-8 in name: {e}")))?
        .to_string();
    let encoded = unsafe { CStr::from_ptr(encoded_value) }
        .to_str()
        .map_err(|e| CoreError::ffi(format!("invalid utf-8 in value: {e}")))?;
    let value = decode_value(encoded)?;

    let handle = unsafe { &*engine };
    handle.with_inner(|inner| {
        inner.scope.remove::<Dynamic>(&name);
        if constant {
            inner.scope.push_constant_dynamic(name, value);
        } else {
            inner.scope.push_dynamic(name, value);
        }
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn rhai_clear_scope(engine: *mut CRhaiEngine) -> i32 {
    catch_panic! {{
        clear_last_error();
        if engine.is_null() {
            set_last_error(&CoreError::ffi("engine pointer is null"));
            return -1;
        }
        let handle = unsafe { &*engine };
        match handle.with_inner(|inner| {
            inner.scope = Scope::new();
            Ok(())
        }) {
            Ok(()) => 0,
            Err(err) => {
                set_last_error(&err);
                -1
            }
        }
    }}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn eval(engine: *mut CRhaiEngine, script: &str) -> Result<String, String> {
        let script = CString::new(script).unwrap();
        let mut out: *mut c_char = std::ptr::null_mut();
        let ret = rhai_eval(engine, script.as_ptr(), &mut out);
        if ret == 0 {
            let s = unsafe { CStr::from_ptr(out) }.to_str().unwrap().to_string();
            crate::error::rhai_free_string(out);
            Ok(s)
        } else {
            let err_ptr = crate::error::rhai_get_last_error();
            let message = unsafe { CStr::from_ptr(err_ptr) }.to_str().unwrap().to_string();
            crate::error::rhai_free_string(err_ptr);
            Err(message)
        }
    }

    #[test]
    fn secure_defaults_sandbox_new_engine() {
        let engine = rhai_engine_new(std::ptr::null());
        assert!(!engine.is_null());
        rhai_engine_free(engine);
    }

    #[test]
    fn custom_config_round_trips_through_c_struct() {
        let config = CRhaiConfig {
            max_operations: 10,
            ..CRhaiConfig::secure_defaults()
        };
        let engine = rhai_engine_new(&config);
        assert!(!engine.is_null());
        let err = eval(engine, "let x = 0; loop { x += 1; }").unwrap_err();
        assert!(err.starts_with("RuntimeError:"));
        rhai_engine_free(engine);
    }

    #[test]
    fn simple_expression_evaluates() {
        let engine = rhai_engine_new(std::ptr::null());
        assert_eq!(eval(engine, "1 + 2").unwrap(), "3");
        rhai_engine_free(engine);
    }

    #[test]
    fn empty_script_yields_null() {
        let engine = rhai_engine_new(std::ptr::null());
        assert_eq!(eval(engine, "").unwrap(), "null");
        rhai_engine_free(engine);
    }

    #[test]
    fn syntax_error_is_reported_with_prefix() {
        let engine = rhai_engine_new(std::ptr::null());
        let err = eval(engine, "let x = ").unwrap_err();
        assert!(err.starts_with("SyntaxError:"));
        rhai_engine_free(engine);
    }

    #[test]
    fn operations_limit_triggers_runtime_error() {
        let config = CRhaiConfig {
            max_operations: 50,
            ..CRhaiConfig::secure_defaults()
        };
        let engine = rhai_engine_new(&config);
        let err = eval(engine, "let x = 0; loop { x += 1; }").unwrap_err();
        assert!(err.starts_with("RuntimeError:"));
        rhai_engine_free(engine);
    }

    #[test]
    fn set_var_is_visible_to_eval() {
        let engine = rhai_engine_new(std::ptr::null());
        let name = CString::new("x").unwrap();
        let value = CString::new("42").unwrap();
        let ret = rhai_set_var(engine, name.as_ptr(), value.as_ptr());
        assert_eq!(ret, 0);
        assert_eq!(eval(engine, "x + 1").unwrap(), "43");
        rhai_engine_free(engine);
    }

    #[test]
    fn clear_scope_removes_variables() {
        let engine = rhai_engine_new(std::ptr::null());
        let name = CString::new("x").unwrap();
        let value = CString::new("42").unwrap();
        rhai_set_var(engine, name.as_ptr(), value.as_ptr());
        rhai_clear_scope(engine);
        assert!(eval(engine, "x").is_err());
        rhai_engine_free(engine);
    }

    #[test]
    fn analyze_does_not_execute() {
        let engine = rhai_engine_new(std::ptr::null());
        let script = CString::new("throw \"boom\";").unwrap();
        let mut out: *mut c_char = std::ptr::null_mut();
        let ret = rhai_analyze(engine, script.as_ptr(), &mut out);
        assert_eq!(ret, 0);
        let encoded = unsafe { CStr::from_ptr(out) }.to_str().unwrap().to_string();
        crate::error::rhai_free_string(out);
        let parsed: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(parsed["valid"], true);
        rhai_engine_free(engine);
    }

    #[test]
    fn analyze_rejects_invalid_syntax() {
        let engine = rhai_engine_new(std::ptr::null());
        let script = CString::new("let x = ").unwrap();
        let mut out: *mut c_char = std::ptr::null_mut();
        rhai_analyze(engine, script.as_ptr(), &mut out);
        let encoded = unsafe { CStr::from_ptr(out) }.to_str().unwrap().to_string();
        crate::error::rhai_free_string(out);
        let parsed: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(parsed["valid"], false);
        rhai_engine_free(engine);
    }

    #[test]
    fn free_is_idempotent_and_use_after_free_is_graceful() {
        let engine = rhai_engine_new(std::ptr::null());
        rhai_engine_free(engine);
        rhai_engine_free(engine);

        let err = eval(engine, "1").unwrap_err();
        assert!(err.starts_with("Disposed:"));
    }
}

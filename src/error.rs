//! Error taxonomy and thread-local diagnostic slot.
//!
//! Internal code threads a [`CoreError`] through ordinary `Result` plumbing.
//! Only the outermost FFI entry point (via the `catch_panic!` family of
//! macros) flattens a `CoreError` to its `Display` string and writes it into
//! the thread-local slot, where the host retrieves it with
//! [`rhai_get_last_error`]. Reading the slot takes the value, so a second
//! read without an intervening failure returns null.

use std::cell::RefCell;
use std::ffi::{c_char, CString};

/// Stable, host-parseable error taxonomy.
///
/// The `Display` impl is the exact prefixed string the host is expected to
/// match on; these prefixes are part of the ABI contract and must not change.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("SyntaxError: {detail} at line {line}")]
    Syntax { detail: String, line: usize },

    #[error("RuntimeError: {detail}")]
    Runtime { detail: String },

    #[error("FFIError: {detail}")]
    Ffi { detail: String },

    #[error("Panic: {detail}")]
    Panic { detail: String },

    #[error("Disposed: {detail}")]
    Disposed { detail: String },
}

impl CoreError {
    pub fn runtime(detail: impl Into<String>) -> Self {
        CoreError::Runtime {
            detail: detail.into(),
        }
    }

    pub fn ffi(detail: impl Into<String>) -> Self {
        CoreError::Ffi {
            detail: detail.into(),
        }
    }

    pub fn disposed(detail: impl Into<String>) -> Self {
        CoreError::Disposed {
            detail: detail.into(),
        }
    }

    /// The human-readable detail without the taxonomy prefix. Used when
    /// re-threading an error through `rhai::EvalAltResult`'s `From<String>`
    /// impl, which would otherwise double the "RuntimeError:" prefix once
    /// the evaluator error is converted back to a `CoreError`.
    pub fn detail(&self) -> &str {
        match self {
            CoreError::Syntax { detail, .. }
            | CoreError::Runtime { detail }
            | CoreError::Ffi { detail }
            | CoreError::Panic { detail }
            | CoreError::Disposed { detail } => detail,
        }
    }
}

impl From<rhai::ParseError> for CoreError {
    fn from(err: rhai::ParseError) -> Self {
        let line = err.1.line().unwrap_or(0);
        CoreError::Syntax {
            detail: err.0.to_string(),
            line,
        }
    }
}

impl From<Box<rhai::EvalAltResult>> for CoreError {
    fn from(err: Box<rhai::EvalAltResult>) -> Self {
        CoreError::Runtime {
            detail: format_eval_error(&err),
        }
    }
}

/// Renders a Rhai evaluation error into the human-readable detail that
/// [`CoreError::Runtime`] carries. Kept as a single match site so every
/// caller gets consistent wording.
pub fn format_eval_error(err: &rhai::EvalAltResult) -> String {
    use rhai::EvalAltResult::*;
    match err {
        ErrorVariableNotFound(name, _) => format!("variable not found: {name}"),
        ErrorFunctionNotFound(sig, _) => format!("function not found: {sig}"),
        ErrorArithmetic(msg, _) => format!("arithmetic error: {msg}"),
        ErrorMismatchDataType(expected, found, _) => {
            format!("type mismatch: expected {expected}, found {found}")
        }
        ErrorIndexNotFound(index, _) => format!("index not found: {index}"),
        ErrorTooManyOperations(_) => "operation limit exceeded".to_string(),
        ErrorStackOverflow(_) => "call stack depth limit exceeded".to_string(),
        ErrorTerminated(_, _) => "evaluation timed out".to_string(),
        ErrorRuntime(value, _) => value.to_string(),
        other => other.to_string(),
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Overwrites the thread-local error slot with `err`'s display string.
/// Called exactly once, from the outermost FFI entry that observed the
/// failure.
pub fn set_last_error(err: &CoreError) {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(err.to_string());
    });
}

/// Overwrites the slot with a raw string, bypassing the `CoreError` enum.
/// Used by the panic-catching macros, which construct the `Panic:` prefix
/// themselves before a `CoreError` value exists.
pub fn set_last_error_str(message: String) {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(message);
    });
}

pub fn clear_last_error() {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = None;
    });
}

/// Takes the current thread's last error as a freshly-allocated C string.
///
/// Reading is destructive: this clears the slot, so a second call without an
/// intervening failure on this thread returns null. The caller owns the
/// returned pointer and must release it with [`rhai_free_string`].
#[no_mangle]
pub extern "C" fn rhai_get_last_error() -> *mut c_char {
    let taken = LAST_ERROR.with(|slot| slot.borrow_mut().take());
    match taken {
        Some(message) => match CString::new(message) {
            Ok(c_string) => c_string.into_raw(),
            Err(_) => std::ptr::null_mut(),
        },
        None => std::ptr::null_mut(),
    }
}

/// Releases any `*mut c_char` previously returned by this crate.
///
/// # Safety
///
/// `ptr` must either be null or a pointer this crate returned, not yet
/// freed.
#[no_mangle]
pub extern "C" fn rhai_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_on_read_clears_slot() {
        clear_last_error();
        assert!(rhai_get_last_error().is_null());

        set_last_error(&CoreError::runtime("boom"));
        let ptr = rhai_get_last_error();
        assert!(!ptr.is_null());
        let message = unsafe { CString::from_raw(ptr).into_string().unwrap() };
        assert_eq!(message, "RuntimeError: boom");

        // second read without an intervening failure: null
        assert!(rhai_get_last_error().is_null());
    }

    #[test]
    fn error_prefixes_match_taxonomy() {
        assert_eq!(
            CoreError::Syntax {
                detail: "unexpected token".into(),
                line: 3
            }
            .to_string(),
            "SyntaxError: unexpected token at line 3"
        );
        assert_eq!(
            CoreError::runtime("division by zero").to_string(),
            "RuntimeError: division by zero"
        );
        assert_eq!(CoreError::ffi("bad utf8").to_string(), "FFIError: bad utf8");
        assert_eq!(
            CoreError::disposed("engine disposed").to_string(),
            "Disposed: engine disposed"
        );
    }

    #[test]
    fn free_string_is_null_safe() {
        rhai_free_string(std::ptr::null_mut());
    }
}

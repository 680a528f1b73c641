//! FFI safety macros.
//!
//! Every `#[no_mangle]` entry point body is wrapped in one of these so that
//! an unwind never crosses the boundary: it is caught, turned into a
//! `CoreError::Panic`, written to the thread-local error slot, and the
//! declared failure sentinel (-1 or null) is returned instead.

/// Wraps a block for FFI functions that return an `i32` status code.
///
/// On panic: -1, with a `Panic:` error recorded.
#[macro_export]
macro_rules! catch_panic {
    ({$($body:tt)*}) => {{
        use std::panic::{catch_unwind, AssertUnwindSafe};
        use $crate::error::{set_last_error, CoreError};

        match catch_unwind(AssertUnwindSafe(|| {
            $($body)*
        })) {
            Ok(result) => result,
            Err(panic_info) => {
                let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };

                tracing::error!(panic = %panic_msg, "ffi call panicked");
                set_last_error(&CoreError::Panic { detail: panic_msg });
                -1
            }
        }
    }};
}

/// Wraps a block for FFI functions that return a pointer.
///
/// On panic: null, with a `Panic:` error recorded.
#[macro_export]
macro_rules! catch_panic_ptr {
    ({$($body:tt)*}) => {{
        use std::panic::{catch_unwind, AssertUnwindSafe};
        use $crate::error::{set_last_error, CoreError};

        match catch_unwind(AssertUnwindSafe(|| {
            $($body)*
        })) {
            Ok(result) => result,
            Err(panic_info) => {
                let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };

                tracing::error!(panic = %panic_msg, "ffi call panicked");
                set_last_error(&CoreError::Panic { detail: panic_msg });
                std::ptr::null_mut()
            }
        }
    }};
}

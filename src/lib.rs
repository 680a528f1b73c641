//! Rhai FFI bridge
//!
//! Embeds the Rhai scripting engine behind a C ABI so a host runtime in any
//! language can compile and evaluate scripts, exchange values, and call back
//! into host-defined functions both synchronously and asynchronously.
//!
//! # Architecture
//!
//! Engines are exposed as an opaque `*mut CRhaiEngine` handle. All FFI entry
//! points are wrapped with panic catching so an unwind never crosses the
//! boundary into the host.
//!
//! # Error handling
//!
//! Failures are communicated through a return code (-1 for status functions,
//! null for pointer-returning ones) plus a thread-local diagnostic message
//! retrievable with [`error::rhai_get_last_error`]. The message carries a
//! stable taxonomy prefix (`SyntaxError:`, `RuntimeError:`, `FFIError:`,
//! `Panic:`, `Disposed:`); see [`error::CoreError`].
//!
//! # Logging
//!
//! The crate emits structured events through the `tracing` facade at module
//! boundaries (engine construction/disposal, callback dispatch, failures). It
//! never installs a global subscriber itself; the host process wires one up
//! if it wants the events.
//!
//! # Module structure
//!
//! - `error`: error taxonomy and the thread-local diagnostic slot
//! - `types`: C-compatible configuration layout and the opaque engine handle
//! - `macros`: panic-catching wrappers shared by every FFI entry point
//! - `engine`: engine lifecycle, evaluation, static analysis, scope management
//! - `values`: the `Dynamic` <-> JSON value codec
//! - `functions`: host callback registration and sync-path dispatch
//! - `async_eval`: async evaluation tickets and the request/response queue

#[macro_use]
pub mod macros;

pub mod async_eval;
pub mod engine;
pub mod error;
pub mod functions;
pub mod types;
pub mod values;

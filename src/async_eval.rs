//! Async evaluation: background worker threads, the deadline shared with
//! the sync path's progress hook, and the request/response queue that lets
//! a suspended script wait on a host callback without blocking the host's
//! own event loop.
//!
//! Terminology follows the core design: a worker thread evaluates one
//! script (a "ticket"); each host-callback call from that thread posts an
//! [`AsyncRequest`] and blocks on a private response slot until the host
//! calls `rhai_async_complete`.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::ffi::{c_char, CStr, CString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use rhai::Dynamic;
use tokio::sync::oneshot;

use crate::error::{clear_last_error, set_last_error, CoreError};
use crate::functions::set_async_eval_mode;
use crate::types::CRhaiEngine;
use crate::values::{decode_value, encode_args, encode_value};
use crate::catch_panic;

struct PendingRequest {
    request_id: u64,
    callback_id: u64,
    encoded_args: String,
}

enum AsyncOutcome {
    Success(String),
    Failure(String),
}

enum TicketState {
    Running,
    Complete {
        encoded: Option<String>,
        error: Option<String>,
    },
}

struct Ticket {
    engine_ptr: usize,
    state: TicketState,
}

lazy_static::lazy_static! {
    static ref PENDING_REQUESTS: Mutex<VecDeque<PendingRequest>> = Mutex::new(VecDeque::new());
    static ref RESPONSE_SLOTS: Mutex<HashMap<u64, (usize, oneshot::Sender<AsyncOutcome>)>> =
        Mutex::new(HashMap::new());
    static ref TICKETS: Mutex<HashMap<u64, Ticket>> = Mutex::new(HashMap::new());
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_EVAL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static DEADLINE: Cell<Option<Instant>> = const { Cell::new(None) };
    static CURRENT_ENGINE_PTR: Cell<usize> = const { Cell::new(0) };
}

/// Installed as the evaluator's `on_progress` hook so the wall-clock budget
/// applies uniformly to the sync and async paths.
pub(crate) fn deadline_exceeded() -> bool {
    DEADLINE
        .with(|cell| cell.get())
        .map(|deadline| Instant::now() >= deadline)
        .unwrap_or(false)
}

pub(crate) fn set_deadline(deadline: Option<Instant>) {
    DEADLINE.with(|cell| cell.set(deadline));
}

pub(crate) fn clear_deadline() {
    DEADLINE.with(|cell| cell.set(None));
}

fn remaining_time() -> Option<Duration> {
    DEADLINE
        .with(|cell| cell.get())
        .map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

/// Called by the callback stub when running on an async worker thread.
/// Enqueues a request, blocks on its private slot bounded by the eval's
/// overall deadline, and returns the decoded response.
pub(crate) fn dispatch_async(callback_id: u64, args: &[Dynamic]) -> Result<Dynamic, CoreError> {
    let encoded_args = encode_args(args)?;
    let engine_ptr = CURRENT_ENGINE_PTR.with(|cell| cell.get());
    let request_id = NEXT_REQUEST_ID.fetch_add(1, Ordering::SeqCst);

    let (tx, rx) = oneshot::channel();
    RESPONSE_SLOTS
        .lock()
        .unwrap()
        .insert(request_id, (engine_ptr, tx));
    PENDING_REQUESTS.lock().unwrap().push_back(PendingRequest {
        request_id,
        callback_id,
        encoded_args,
    });

    let wait = remaining_time();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| CoreError::ffi(format!("failed to start wait runtime: {e}")))?;

    let outcome = runtime.block_on(async {
        match wait {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => AsyncOutcome::Failure("host response channel closed".to_string()),
                Err(_) => AsyncOutcome::Failure("host callback timeout".to_string()),
            },
            None => match rx.await {
                Ok(outcome) => outcome,
                Err(_) => AsyncOutcome::Failure("host response channel closed".to_string()),
            },
        }
    });
    RESPONSE_SLOTS.lock().unwrap().remove(&request_id);

    match outcome {
        AsyncOutcome::Success(encoded) => decode_value(&encoded),
        AsyncOutcome::Failure(message) => Err(CoreError::runtime(message)),
    }
}

/// Fails every outstanding request/response slot and ticket belonging to
/// `engine_ptr` with a `Disposed` outcome. Called from `rhai_engine_free`.
pub(crate) fn dispose_tickets_for_engine(engine_ptr: usize) {
    let mut slots = RESPONSE_SLOTS.lock().unwrap();
    let stale: Vec<u64> = slots
        .iter()
        .filter(|(_, (ptr, _))| *ptr == engine_ptr)
        .map(|(id, _)| *id)
        .collect();
    for id in &stale {
        if let Some((_, tx)) = slots.remove(id) {
            let _ = tx.send(AsyncOutcome::Failure("engine disposed".to_string()));
        }
    }
    drop(slots);

    let stale: std::collections::HashSet<u64> = stale.into_iter().collect();
    PENDING_REQUESTS
        .lock()
        .unwrap()
        .retain(|req| !stale.contains(&req.request_id));

    let mut tickets = TICKETS.lock().unwrap();
    for ticket in tickets.values_mut() {
        if ticket.engine_ptr == engine_ptr && matches!(ticket.state, TicketState::Running) {
            ticket.state = TicketState::Complete {
                encoded: None,
                error: Some(CoreError::disposed("engine disposed").to_string()),
            };
        }
    }
}

#[no_mangle]
pub extern "C" fn rhai_eval_async_start(
    engine: *const CRhaiEngine,
    script: *const c_char,
    eval_id_out: *mut u64,
) -> i32 {
    catch_panic! {{
        clear_last_error();
        match eval_async_start_impl(engine, script, eval_id_out) {
            Ok(()) => 0,
            Err(err) => {
                set_last_error(&err);
                -1
            }
        }
    }}
}

fn eval_async_start_impl(
    engine: *const CRhaiEngine,
    script: *const c_char,
    eval_id_out: *mut u64,
) -> Result<(), CoreError> {
    if engine.is_null() {
        return Err(CoreError::ffi("engine pointer is null"));
    }
    if script.is_null() {
        return Err(CoreError::ffi("script pointer is null"));
    }
    if eval_id_out.is_null() {
        return Err(CoreError::ffi("eval id output pointer is null"));
    }

    let script = unsafe { CStr::from_ptr(script) }
        .to_str()
        .map_err(|e| CoreError::ffi(format!("invalid utf-8 in script: {e}")))?
        .to_string();

    let handle = unsafe { &*engine };
    if !handle.is_alive() {
        return Err(CoreError::disposed("engine has been freed"));
    }

    let timeout_ms = handle.with_inner(|inner| Ok(inner.config.timeout_ms))?;
    let ticket_id = NEXT_EVAL_ID.fetch_add(1, Ordering::SeqCst);
    let engine_ptr = engine as usize;
    TICKETS.lock().unwrap().insert(
        ticket_id,
        Ticket {
            engine_ptr,
            state: TicketState::Running,
        },
    );

    thread::spawn(move || {
        let handle: &CRhaiEngine = unsafe { &*(engine_ptr as *const CRhaiEngine) };
        CURRENT_ENGINE_PTR.with(|cell| cell.set(engine_ptr));
        set_async_eval_mode(true);
        crate::functions::clear_async_detected();
        set_deadline(timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms)));

        let eval_result = handle.with_inner(|inner| {
            inner
                .engine
                .eval_with_scope::<Dynamic>(&mut inner.scope, &script)
                .map_err(CoreError::from)
        });

        clear_deadline();
        set_async_eval_mode(false);
        CURRENT_ENGINE_PTR.with(|cell| cell.set(0));

        let (encoded, error) = match eval_result {
            Ok(value) => match encode_value(&value) {
                Ok(json) => (Some(json), None),
                Err(err) => (None, Some(err.to_string())),
            },
            Err(err) => (None, Some(err.to_string())),
        };

        let mut tickets = TICKETS.lock().unwrap();
        if let Some(ticket) = tickets.get_mut(&ticket_id) {
            // A concurrent dispose may already have marked this Complete;
            // don't clobber a disposal outcome with a late result.
            if matches!(ticket.state, TicketState::Running) {
                ticket.state = TicketState::Complete { encoded, error };
            }
        }
    });

    unsafe {
        *eval_id_out = ticket_id;
    }
    Ok(())
}

/// Non-blocking poll. `out_done` is set true once the ticket is finished; on
/// success `out_encoded` receives the encoded result, on failure the
/// function returns -1 and the failure is available via
/// [`crate::error::rhai_get_last_error`].
#[no_mangle]
pub extern "C" fn rhai_eval_async_poll(
    eval_id: u64,
    out_encoded: *mut *mut c_char,
    out_done: *mut u8,
) -> i32 {
    catch_panic! {{
        clear_last_error();
        if out_encoded.is_null() || out_done.is_null() {
            set_last_error(&CoreError::ffi("output pointer is null"));
            return -1;
        }

        let mut tickets = TICKETS.lock().unwrap();
        let ticket = match tickets.get(&eval_id) {
            Some(t) => t,
            None => {
                set_last_error(&CoreError::ffi(format!("unknown eval id: {eval_id}")));
                return -1;
            }
        };

        match &ticket.state {
            TicketState::Running => {
                unsafe {
                    *out_done = 0;
                    *out_encoded = std::ptr::null_mut();
                }
                0
            }
            TicketState::Complete { encoded, error } => {
                let encoded = encoded.clone();
                let error = error.clone();
                tickets.remove(&eval_id);
                drop(tickets);

                unsafe {
                    *out_done = 1;
                }
                match (encoded, error) {
                    (Some(json), None) => {
                        let c_string = match CString::new(json) {
                            Ok(c) => c,
                            Err(e) => {
                                set_last_error(&CoreError::ffi(format!("embedded NUL in result: {e}")));
                                return -1;
                            }
                        };
                        unsafe {
                            *out_encoded = c_string.into_raw();
                        }
                        0
                    }
                    (None, Some(message)) => {
                        unsafe {
                            *out_encoded = std::ptr::null_mut();
                        }
                        crate::error::set_last_error_str(message);
                        -1
                    }
                    _ => {
                        set_last_error(&CoreError::ffi("ticket in an inconsistent state"));
                        -1
                    }
                }
            }
        }
    }}
}

/// One request surfaced to the host for it to execute and answer via
/// [`rhai_async_complete`].
#[repr(C)]
pub struct CRhaiAsyncRequest {
    pub request_id: u64,
    pub callback_id: u64,
    pub encoded_args: *mut c_char,
}

/// Non-blocking dequeue. Returns 1 with `out_request` populated, 0 if the
/// queue is empty, -1 on error.
#[no_mangle]
pub extern "C" fn rhai_async_dequeue_request(out_request: *mut CRhaiAsyncRequest) -> i32 {
    catch_panic! {{
        clear_last_error();
        if out_request.is_null() {
            set_last_error(&CoreError::ffi("output pointer is null"));
            return -1;
        }

        let request = PENDING_REQUESTS.lock().unwrap().pop_front();
        match request {
            None => 0,
            Some(req) => {
                let encoded_args = match CString::new(req.encoded_args) {
                    Ok(c) => c.into_raw(),
                    Err(e) => {
                        set_last_error(&CoreError::ffi(format!("embedded NUL in args: {e}")));
                        return -1;
                    }
                };
                unsafe {
                    (*out_request).request_id = req.request_id;
                    (*out_request).callback_id = req.callback_id;
                    (*out_request).encoded_args = encoded_args;
                }
                1
            }
        }
    }}
}

/// Delivers a response for a previously dequeued request. Exactly one of
/// `encoded`/`error` must be non-null; both are borrowed.
#[no_mangle]
pub extern "C" fn rhai_async_complete(
    request_id: u64,
    encoded: *const c_char,
    error: *const c_char,
) -> i32 {
    catch_panic! {{
        clear_last_error();
        match complete_impl(request_id, encoded, error) {
            Ok(()) => 0,
            Err(err) => {
                set_last_error(&err);
                -1
            }
        }
    }}
}

fn complete_impl(
    request_id: u64,
    encoded: *const c_char,
    error: *const c_char,
) -> Result<(), CoreError> {
    let outcome = match (encoded.is_null(), error.is_null()) {
        (false, true) => {
            let text = unsafe { CStr::from_ptr(encoded) }
                .to_str()
                .map_err(|e| CoreError::ffi(format!("invalid utf-8 in response: {e}")))?
                .to_string();
            AsyncOutcome::Success(text)
        }
        (true, false) => {
            let text = unsafe { CStr::from_ptr(error) }
                .to_str()
                .map_err(|e| CoreError::ffi(format!("invalid utf-8 in error: {e}")))?
                .to_string();
            AsyncOutcome::Failure(text)
        }
        _ => {
            return Err(CoreError::ffi(
                "exactly one of encoded/error must be non-null",
            ))
        }
    };

    let sender = RESPONSE_SLOTS.lock().unwrap().remove(&request_id);
    match sender {
        Some((_, tx)) => tx
            .send(outcome)
            .map_err(|_| CoreError::ffi("worker thread is no longer waiting")),
        None => Err(CoreError::ffi(format!(
            "unknown or already-completed request id: {request_id}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{rhai_engine_free, rhai_engine_new};
    use std::ffi::CString;
    use std::thread::sleep;

    #[test]
    fn dequeue_on_empty_queue_returns_zero() {
        let mut out = CRhaiAsyncRequest {
            request_id: 0,
            callback_id: 0,
            encoded_args: std::ptr::null_mut(),
        };
        // Drain whatever other tests may have left behind.
        while rhai_async_dequeue_request(&mut out) == 1 {
            crate::error::rhai_free_string(out.encoded_args);
        }
        assert_eq!(rhai_async_dequeue_request(&mut out), 0);
    }

    #[test]
    fn complete_unknown_request_is_an_error() {
        let ret = complete_impl(999_999, std::ptr::null(), std::ptr::null());
        assert!(ret.is_err());
    }

    #[test]
    fn async_eval_round_trip_without_callbacks() {
        let engine = rhai_engine_new(std::ptr::null());
        let script = CString::new("1 + 2").unwrap();
        let mut eval_id = 0u64;
        let ret = rhai_eval_async_start(engine, script.as_ptr(), &mut eval_id);
        assert_eq!(ret, 0);

        let mut out_encoded: *mut c_char = std::ptr::null_mut();
        let mut out_done: u8 = 0;
        let mut attempts = 0;
        loop {
            let ret = rhai_eval_async_poll(eval_id, &mut out_encoded, &mut out_done);
            assert_eq!(ret, 0);
            if out_done == 1 {
                break;
            }
            attempts += 1;
            assert!(attempts < 1000, "ticket never completed");
            sleep(Duration::from_millis(5));
        }

        let result = unsafe { CStr::from_ptr(out_encoded) }.to_str().unwrap();
        assert_eq!(result, "3");
        crate::error::rhai_free_string(out_encoded);
        rhai_engine_free(engine);
    }

    fn poll_until_done(eval_id: u64) -> (i32, *mut c_char) {
        let mut out_encoded: *mut c_char = std::ptr::null_mut();
        let mut out_done: u8 = 0;
        let mut attempts = 0;
        loop {
            let ret = rhai_eval_async_poll(eval_id, &mut out_encoded, &mut out_done);
            if out_done == 1 {
                return (ret, out_encoded);
            }
            attempts += 1;
            assert!(attempts < 1000, "ticket never completed");
            sleep(Duration::from_millis(5));
        }
    }

    fn dequeue_blocking() -> CRhaiAsyncRequest {
        let mut out = CRhaiAsyncRequest {
            request_id: 0,
            callback_id: 0,
            encoded_args: std::ptr::null_mut(),
        };
        let mut attempts = 0;
        loop {
            let ret = rhai_async_dequeue_request(&mut out);
            assert_ne!(ret, -1);
            if ret == 1 {
                return out;
            }
            attempts += 1;
            assert!(attempts < 1000, "request never enqueued");
            sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn async_eval_round_trip_through_a_registered_callback() {
        let engine = rhai_engine_new(std::ptr::null());
        let name = CString::new("double").unwrap();
        assert_eq!(
            crate::functions::rhai_register_function(engine, name.as_ptr(), 7, 1),
            0
        );

        let script = CString::new("double(21)").unwrap();
        let mut eval_id = 0u64;
        assert_eq!(
            rhai_eval_async_start(engine, script.as_ptr(), &mut eval_id),
            0
        );

        let request = dequeue_blocking();
        assert_eq!(request.callback_id, 7);
        let args = unsafe { CStr::from_ptr(request.encoded_args) }
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(args, "[21]");
        crate::error::rhai_free_string(request.encoded_args);

        let response = CString::new("42").unwrap();
        assert_eq!(
            rhai_async_complete(request.request_id, response.as_ptr(), std::ptr::null()),
            0
        );

        let (ret, out_encoded) = poll_until_done(eval_id);
        assert_eq!(ret, 0);
        let result = unsafe { CStr::from_ptr(out_encoded) }.to_str().unwrap();
        assert_eq!(result, "42");
        crate::error::rhai_free_string(out_encoded);
        rhai_engine_free(engine);
    }

    #[test]
    fn disposing_the_engine_fails_a_pending_ticket_with_the_disposed_prefix() {
        let engine = rhai_engine_new(std::ptr::null());
        let name = CString::new("wait_forever").unwrap();
        assert_eq!(
            crate::functions::rhai_register_function(engine, name.as_ptr(), 8, 0),
            0
        );

        let script = CString::new("wait_forever()").unwrap();
        let mut eval_id = 0u64;
        assert_eq!(
            rhai_eval_async_start(engine, script.as_ptr(), &mut eval_id),
            0
        );

        let request = dequeue_blocking();
        crate::error::rhai_free_string(request.encoded_args);

        // Free the engine while the request is still outstanding, instead of
        // ever calling rhai_async_complete for it.
        rhai_engine_free(engine);

        let (ret, _) = poll_until_done(eval_id);
        assert_eq!(ret, -1);

        let err_ptr = crate::error::rhai_get_last_error();
        assert!(!err_ptr.is_null());
        let message = unsafe { CStr::from_ptr(err_ptr) }.to_str().unwrap().to_string();
        crate::error::rhai_free_string(err_ptr);
        assert_eq!(message, "Disposed: engine disposed");
    }
}

//! FFI bindings for Lumen Telemetry
//!
//! C-compatible functions for embedding hosts. Structured values cross the
//! boundary as JSON in null-terminated strings. Returned strings are allocated
//! here and must be freed by the caller using `lumen_free_string`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;

use chrono::{DateTime, TimeZone, Utc};

use crate::config::PipelineConfig;
use crate::dedup::ClickTarget;
use crate::lifecycle::LifecycleEvent;
use crate::pipeline::Pipeline;
use crate::principal::Principal;
use crate::stuck::{
    create_context, detect_stuck_event, update_after_answer, update_after_hint, StuckContext,
    StuckRules,
};
use crate::transport::NdjsonStore;
use crate::types::{EventData, EventType};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Helper to convert C string to Rust string
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn millis_to_datetime(now_ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(now_ms).single()
}

/// Serialize `value`, or record the error and return NULL
fn to_json_cstr<T: serde::Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

unsafe fn parse_context(context_json: *const c_char) -> Option<StuckContext> {
    let Some(json) = cstr_to_string(context_json) else {
        set_last_error("Invalid context string pointer");
        return None;
    };
    match serde_json::from_str(&json) {
        Ok(context) => Some(context),
        Err(e) => {
            set_last_error(&format!("Invalid context JSON: {}", e));
            None
        }
    }
}

// ============================================================================
// Stuck detection (stateless)
// ============================================================================

/// Create a fresh stuck context and return it as JSON.
///
/// # Safety
/// - `section_id` and `problem_id` must be valid null-terminated C strings or NULL.
/// - Returns a newly allocated string that must be freed with `lumen_free_string`.
/// - Returns NULL on error; call `lumen_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn lumen_stuck_create_context(
    section_id: *const c_char,
    problem_id: *const c_char,
    now_ms: i64,
) -> *mut c_char {
    clear_last_error();

    let Some(now) = millis_to_datetime(now_ms) else {
        set_last_error("Timestamp out of range");
        return ptr::null_mut();
    };

    let context = create_context(cstr_to_string(section_id), cstr_to_string(problem_id), now);
    to_json_cstr(&context)
}

/// Apply an answer outcome to a context.
///
/// # Safety
/// - `context_json` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `lumen_free_string`.
/// - Returns NULL on error; call `lumen_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn lumen_stuck_update_after_answer(
    context_json: *const c_char,
    is_correct: bool,
    has_unit_error: bool,
    now_ms: i64,
) -> *mut c_char {
    clear_last_error();

    let Some(context) = parse_context(context_json) else {
        return ptr::null_mut();
    };
    let Some(now) = millis_to_datetime(now_ms) else {
        set_last_error("Timestamp out of range");
        return ptr::null_mut();
    };

    to_json_cstr(&update_after_answer(&context, is_correct, has_unit_error, now))
}

/// Apply a hint request to a context.
///
/// # Safety
/// - `context_json` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `lumen_free_string`.
/// - Returns NULL on error; call `lumen_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn lumen_stuck_update_after_hint(
    context_json: *const c_char,
    now_ms: i64,
) -> *mut c_char {
    clear_last_error();

    let Some(context) = parse_context(context_json) else {
        return ptr::null_mut();
    };
    let Some(now) = millis_to_datetime(now_ms) else {
        set_last_error("Timestamp out of range");
        return ptr::null_mut();
    };

    to_json_cstr(&update_after_hint(&context, now))
}

/// Evaluate the stuck rules.
///
/// Returns `{"context": ..., "event": ... | null}`; the returned context carries
/// any counter reset and replaces the one passed in.
///
/// # Safety
/// - `context_json` must be a valid null-terminated C string.
/// - `rules_json` must be a valid null-terminated C string, or NULL for defaults.
/// - Returns a newly allocated string that must be freed with `lumen_free_string`.
/// - Returns NULL on error; call `lumen_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn lumen_stuck_detect(
    context_json: *const c_char,
    rules_json: *const c_char,
    now_ms: i64,
) -> *mut c_char {
    clear_last_error();

    let Some(context) = parse_context(context_json) else {
        return ptr::null_mut();
    };
    let rules = match cstr_to_string(rules_json) {
        Some(json) => match serde_json::from_str::<StuckRules>(&json) {
            Ok(rules) => rules,
            Err(e) => {
                set_last_error(&format!("Invalid rules JSON: {}", e));
                return ptr::null_mut();
            }
        },
        None => StuckRules::default(),
    };
    let Some(now) = millis_to_datetime(now_ms) else {
        set_last_error("Timestamp out of range");
        return ptr::null_mut();
    };

    let detection = detect_stuck_event(&context, &rules, now);
    to_json_cstr(&serde_json::json!({
        "context": detection.context,
        "event": detection.event,
    }))
}

// ============================================================================
// Pipeline API (stateful)
// ============================================================================

/// Opaque handle to a Pipeline
pub struct LumenPipelineHandle {
    pipeline: Pipeline,
}

/// Create a pipeline that appends to a newline-delimited JSON file.
///
/// # Safety
/// - `config_json` must be a valid null-terminated C string, or NULL for defaults.
/// - `store_path` must be a valid null-terminated C string.
/// - Returns a pointer that must be freed with `lumen_pipeline_free`.
/// - Returns NULL on error; call `lumen_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn lumen_pipeline_new(
    config_json: *const c_char,
    store_path: *const c_char,
) -> *mut LumenPipelineHandle {
    clear_last_error();

    let config = match cstr_to_string(config_json) {
        Some(json) => match PipelineConfig::from_json(&json) {
            Ok(config) => config,
            Err(e) => {
                set_last_error(&e.to_string());
                return ptr::null_mut();
            }
        },
        None => PipelineConfig::default(),
    };

    let Some(path) = cstr_to_string(store_path) else {
        set_last_error("Invalid store path pointer");
        return ptr::null_mut();
    };

    let pipeline = Pipeline::new(config, NdjsonStore::new(path));
    Box::into_raw(Box::new(LumenPipelineHandle { pipeline }))
}

/// Free a pipeline. Does not end its session.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `lumen_pipeline_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn lumen_pipeline_free(handle: *mut LumenPipelineHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Open a session and return its id.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `lumen_pipeline_new`.
/// - `principal_id` must be a valid null-terminated C string, or NULL for a guest.
/// - Returns a newly allocated string that must be freed with `lumen_free_string`.
#[no_mangle]
pub unsafe extern "C" fn lumen_pipeline_init_session(
    handle: *mut LumenPipelineHandle,
    principal_id: *const c_char,
) -> *mut c_char {
    clear_last_error();

    let Some(handle) = handle.as_mut() else {
        set_last_error("Null pipeline pointer");
        return ptr::null_mut();
    };

    let principal = cstr_to_string(principal_id).map(Principal::authenticated);
    let session_id = handle.pipeline.init_session(principal);
    string_to_cstr(&session_id)
}

/// Log one event and return it as JSON.
///
/// NULL with no error set means the event was not recorded: there is no open
/// session or the payload was malformed.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `lumen_pipeline_new`.
/// - `event_type` must be a valid null-terminated C string.
/// - `target`, `data_json` and `section` must be valid null-terminated C strings or NULL.
/// - Returns a newly allocated string that must be freed with `lumen_free_string`.
#[no_mangle]
pub unsafe extern "C" fn lumen_pipeline_log_event(
    handle: *mut LumenPipelineHandle,
    event_type: *const c_char,
    target: *const c_char,
    data_json: *const c_char,
    section: *const c_char,
) -> *mut c_char {
    clear_last_error();

    let Some(handle) = handle.as_mut() else {
        set_last_error("Null pipeline pointer");
        return ptr::null_mut();
    };
    let Some(event_type) = cstr_to_string(event_type) else {
        set_last_error("Invalid event type pointer");
        return ptr::null_mut();
    };
    let data = match cstr_to_string(data_json) {
        Some(json) => match serde_json::from_str::<EventData>(&json) {
            Ok(data) => data,
            Err(e) => {
                set_last_error(&format!("Invalid data JSON: {}", e));
                return ptr::null_mut();
            }
        },
        None => EventData::new(),
    };

    let target = cstr_to_string(target);
    let section = cstr_to_string(section);
    match handle.pipeline.log_event(
        EventType::from_name(&event_type),
        target.as_deref(),
        data,
        section.as_deref(),
    ) {
        Some(event) => to_json_cstr(&event),
        None => ptr::null_mut(),
    }
}

/// Log a click through the merge filter and return it as JSON.
///
/// `target_json` is a `ClickTarget` object (`test_id`, `element_id`,
/// `class_name`, all optional). NULL with no error set means the click was
/// merged into the previous one or there is no open session.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `lumen_pipeline_new`.
/// - `target_json` and `section` must be valid null-terminated C strings or NULL.
/// - Returns a newly allocated string that must be freed with `lumen_free_string`.
#[no_mangle]
pub unsafe extern "C" fn lumen_pipeline_log_click(
    handle: *mut LumenPipelineHandle,
    target_json: *const c_char,
    x: f64,
    y: f64,
    section: *const c_char,
) -> *mut c_char {
    clear_last_error();

    let Some(handle) = handle.as_mut() else {
        set_last_error("Null pipeline pointer");
        return ptr::null_mut();
    };
    let target = match cstr_to_string(target_json) {
        Some(json) => match serde_json::from_str::<ClickTarget>(&json) {
            Ok(target) => target,
            Err(e) => {
                set_last_error(&format!("Invalid click target JSON: {}", e));
                return ptr::null_mut();
            }
        },
        None => ClickTarget::default(),
    };

    let section = cstr_to_string(section);
    match handle.pipeline.log_click(&target, x, y, section.as_deref()) {
        Some(event) => to_json_cstr(&event),
        None => ptr::null_mut(),
    }
}

/// Log a scroll depth through the bucket filter and return it as JSON.
///
/// NULL with no error set means the depth stayed in the last emitted bucket or
/// there is no open session.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `lumen_pipeline_new`.
/// - `section` must be a valid null-terminated C string or NULL.
/// - Returns a newly allocated string that must be freed with `lumen_free_string`.
#[no_mangle]
pub unsafe extern "C" fn lumen_pipeline_log_scroll(
    handle: *mut LumenPipelineHandle,
    depth_pct: f64,
    section: *const c_char,
) -> *mut c_char {
    clear_last_error();

    let Some(handle) = handle.as_mut() else {
        set_last_error("Null pipeline pointer");
        return ptr::null_mut();
    };

    let section = cstr_to_string(section);
    match handle.pipeline.log_scroll(depth_pct, section.as_deref()) {
        Some(event) => to_json_cstr(&event),
        None => ptr::null_mut(),
    }
}

/// Poll the flush timer. Returns 1 when a batch was delivered, 0 otherwise,
/// -1 on a null handle.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `lumen_pipeline_new`.
#[no_mangle]
pub unsafe extern "C" fn lumen_pipeline_tick(handle: *mut LumenPipelineHandle) -> c_int {
    clear_last_error();
    match handle.as_mut() {
        Some(handle) => c_int::from(handle.pipeline.tick()),
        None => {
            set_last_error("Null pipeline pointer");
            -1
        }
    }
}

/// Flush now. Returns 1 when a batch was delivered, 0 otherwise, -1 on a null
/// handle.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `lumen_pipeline_new`.
#[no_mangle]
pub unsafe extern "C" fn lumen_pipeline_flush(handle: *mut LumenPipelineHandle) -> c_int {
    clear_last_error();
    match handle.as_mut() {
        Some(handle) => c_int::from(handle.pipeline.flush()),
        None => {
            set_last_error("Null pipeline pointer");
            -1
        }
    }
}

/// Forward a lifecycle notification: "hidden", "visible" or "unload".
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `lumen_pipeline_new`.
/// - `event` must be a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn lumen_pipeline_lifecycle(
    handle: *mut LumenPipelineHandle,
    event: *const c_char,
) -> c_int {
    clear_last_error();

    let Some(handle) = handle.as_mut() else {
        set_last_error("Null pipeline pointer");
        return -1;
    };
    let Some(name) = cstr_to_string(event) else {
        set_last_error("Invalid lifecycle event pointer");
        return -1;
    };
    let event = match serde_json::from_value::<LifecycleEvent>(serde_json::Value::String(name)) {
        Ok(event) => event,
        Err(e) => {
            set_last_error(&format!("Unknown lifecycle event: {}", e));
            return -1;
        }
    };

    handle.pipeline.on_lifecycle(event);
    0
}

/// End the session. Returns 1 if one was open, 0 if not, -1 on a null handle.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `lumen_pipeline_new`.
#[no_mangle]
pub unsafe extern "C" fn lumen_pipeline_end_session(handle: *mut LumenPipelineHandle) -> c_int {
    clear_last_error();
    match handle.as_mut() {
        Some(handle) => c_int::from(handle.pipeline.end_session()),
        None => {
            set_last_error("Null pipeline pointer");
            -1
        }
    }
}

/// Diagnostic snapshot as JSON.
///
/// # Safety
/// - `handle` must be a valid pointer returned by `lumen_pipeline_new`.
/// - Returns a newly allocated string that must be freed with `lumen_free_string`.
#[no_mangle]
pub unsafe extern "C" fn lumen_pipeline_session_info(
    handle: *const LumenPipelineHandle,
) -> *mut c_char {
    clear_last_error();
    match handle.as_ref() {
        Some(handle) => to_json_cstr(&handle.pipeline.session_info()),
        None => {
            set_last_error("Null pipeline pointer");
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by Lumen functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a Lumen function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn lumen_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next Lumen function call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn lumen_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn lumen_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

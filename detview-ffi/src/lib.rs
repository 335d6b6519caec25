//! FFI bindings for the detview record store
//!
//! This module provides a C-compatible interface to the record store and its
//! points-of-interest navigation, for viewers written in other languages.
//!
//! # Safety Guarantees
//!
//! - No panic may cross the FFI boundary (enforced by `ffi_guard`)
//! - Strict UTF-8 validation for all string inputs and outputs
//! - Null pointer checks on all pointer arguments
//! - ABI stability via `#[repr(C)]` and `extern "C"`
//!
//! # Error Handling
//!
//! Errors are reported through:
//! - Return values: NULL for constructors, `-1` for status and length returns
//! - Thread-local error message: `detview_last_error_message()`
//!
//! # Thread Safety
//!
//! Every function takes a shared handle. One thread may load (directly or via
//! `detview_load_async`) while any number of threads query.

use detview_core::{LoadStop, RecordStore, StoreOptions};
use libc::{c_char, c_int, size_t};
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::ptr;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

/// Internal state holder (not exposed to C)
struct DetviewStoreState {
    inner: Arc<RecordStore>,
}

/// Opaque handle to a record store (C-compatible)
///
/// C code only sees pointers to this type. The real data is stored in
/// `DetviewStoreState`.
#[repr(C)]
pub struct DetviewStore {
    _private: [u8; 0],
}

thread_local! {
    /// Last error of the current thread
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Set the last error message for the current thread
///
/// Interior NULs are escaped so that reporting never fails.
fn set_last_error(err: impl std::fmt::Display) {
    LAST_ERROR.with(|cell| {
        let safe_msg = err.to_string().replace('\0', "\\0");
        let c_str = CString::new(safe_msg).unwrap_or_default();
        *cell.borrow_mut() = Some(c_str);
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

/// Panic barrier for every exported function
///
/// A caught panic is turned into an error message and `None`; the operation
/// is abandoned, never resumed.
fn ffi_guard<F, R>(f: F) -> Option<R>
where
    F: FnOnce() -> R,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(e) => {
            let msg = if let Some(s) = e.downcast_ref::<&str>() {
                format!("Panic: {}", s)
            } else if let Some(s) = e.downcast_ref::<String>() {
                format!("Panic: {}", s)
            } else {
                "Unknown panic".to_string()
            };
            set_last_error(msg);
            None
        }
    }
}

/// Borrow the store behind a handle, recording an error for NULL
///
/// # Safety
///
/// `ptr` must be NULL or a live pointer returned by a `detview_new*` call.
unsafe fn store_ref<'a>(ptr: *const DetviewStore) -> Option<&'a Arc<RecordStore>> {
    let state = unsafe { (ptr as *const DetviewStoreState).as_ref() };
    match state {
        Some(s) => Some(&s.inner),
        None => {
            set_last_error("Store pointer cannot be NULL");
            None
        }
    }
}

fn into_handle(store: RecordStore) -> *mut DetviewStore {
    let state = Box::new(DetviewStoreState { inner: Arc::new(store) });
    Box::into_raw(state) as *mut DetviewStore
}

//
// === LIFECYCLE MANAGEMENT ===
//

/// Create a store monitoring classes 1 and 2 with threshold 10
///
/// # Returns
///
/// - Non-NULL pointer on success
/// - NULL on failure (check `detview_last_error_message()`)
///
/// # Example (C)
///
/// ```c
/// DetviewStore* store = detview_new();
/// if (store == NULL) {
///     fprintf(stderr, "Error: %s\n", detview_last_error_message());
///     exit(1);
/// }
/// ```
#[unsafe(no_mangle)]
pub extern "C" fn detview_new() -> *mut DetviewStore {
    ffi_guard(|| match RecordStore::new(StoreOptions::default()) {
        Ok(store) => {
            clear_last_error();
            into_handle(store)
        }
        Err(e) => {
            set_last_error(format!("{:#}", e));
            ptr::null_mut()
        }
    })
    .unwrap_or(ptr::null_mut())
}

/// Create a store with custom monitored classes and score threshold
///
/// # Arguments
///
/// - `classes`: Pointer to `len` class ids, in output order (must not be NULL)
/// - `len`: Number of monitored classes (must be > 0)
/// - `threshold`: Detections count if their score is strictly above this (0-100)
///
/// # Safety
///
/// `classes` must point to at least `len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn detview_new_with_options(
    classes: *const i8,
    len: size_t,
    threshold: i8,
) -> *mut DetviewStore {
    ffi_guard(|| {
        if classes.is_null() {
            set_last_error("Classes pointer cannot be NULL");
            return ptr::null_mut();
        }

        // SAFETY: Caller guarantees classes points to len elements
        let monitored = unsafe { slice::from_raw_parts(classes, len) };
        let options = StoreOptions {
            monitored_classes: monitored.to_vec(),
            score_threshold: threshold,
            ..Default::default()
        };

        match RecordStore::new(options) {
            Ok(store) => {
                clear_last_error();
                into_handle(store)
            }
            Err(e) => {
                set_last_error(format!("{:#}", e));
                ptr::null_mut()
            }
        }
    })
    .unwrap_or(ptr::null_mut())
}

/// Free a store and release all resources
///
/// A background load still running keeps its own reference and finishes
/// before the memory is released.
///
/// # Safety
///
/// - `ptr` must be NULL or a valid pointer from a `detview_new*` call
/// - After this call, `ptr` is invalid and must not be used
/// - Safe to call with NULL (no-op)
#[unsafe(no_mangle)]
pub unsafe extern "C" fn detview_free(ptr: *mut DetviewStore) {
    if ptr.is_null() {
        return;
    }

    let _ = ffi_guard(|| {
        // SAFETY: Caller guarantees ptr came from Box::into_raw in detview_new*
        let _ = unsafe { Box::from_raw(ptr as *mut DetviewStoreState) };
    });
}

//
// === LOADING ===
//

/// Bind a record file, discarding everything derived from the previous one
///
/// # Returns
///
/// - `0` on success
/// - `-1` on failure (check `detview_last_error_message()`)
///
/// # Safety
///
/// - `ptr` must be a valid store pointer
/// - `path` must be a valid, NUL-terminated UTF-8 string
#[unsafe(no_mangle)]
pub unsafe extern "C" fn detview_open(ptr: *const DetviewStore, path: *const c_char) -> c_int {
    ffi_guard(|| {
        let Some(store) = (unsafe { store_ref(ptr) }) else {
            return -1;
        };
        if path.is_null() {
            set_last_error("Path cannot be NULL");
            return -1;
        }

        // SAFETY: Caller guarantees path is valid C string
        let c_path = unsafe { CStr::from_ptr(path) };

        // Strict: no to_string_lossy()
        let path_str = match c_path.to_str() {
            Ok(s) => s,
            Err(_) => {
                set_last_error("Path must be valid UTF-8");
                return -1;
            }
        };

        match store.open(path_str) {
            Ok(()) => {
                clear_last_error();
                0
            }
            Err(e) => {
                set_last_error(format!("{:#}", e));
                -1
            }
        }
    })
    .unwrap_or(-1)
}

/// Stream the bound file on the calling thread
///
/// # Returns
///
/// - Number of records ingested on success
/// - `-1` if no file is open or another call already claimed the load
///
/// A load stopped by a damaged record still returns the ingested count and
/// leaves the reason in `detview_last_error_message()`.
///
/// # Safety
///
/// `ptr` must be a valid store pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn detview_load(ptr: *const DetviewStore) -> i64 {
    ffi_guard(|| {
        let Some(store) = (unsafe { store_ref(ptr) }) else {
            return -1;
        };

        match store.load() {
            Some(report) => {
                match report.stop {
                    LoadStop::EndOfStream => clear_last_error(),
                    LoadStop::Error(err) => set_last_error(err),
                }
                i64::from(report.records)
            }
            None => {
                set_last_error("No file open or load already claimed");
                -1
            }
        }
    })
    .unwrap_or(-1)
}

/// Start the load on a background thread and return immediately
///
/// Pair with `detview_wait_loaded()` to observe completion.
///
/// # Returns
///
/// - `0` if the loader thread was started
/// - `-1` on failure
///
/// # Safety
///
/// `ptr` must be a valid store pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn detview_load_async(ptr: *const DetviewStore) -> c_int {
    ffi_guard(|| {
        let Some(store) = (unsafe { store_ref(ptr) }) else {
            return -1;
        };

        match store.load_in_background() {
            Ok(_detached) => {
                clear_last_error();
                0
            }
            Err(e) => {
                set_last_error(format!("{:#}", e));
                -1
            }
        }
    })
    .unwrap_or(-1)
}

/// Block until the load of the bound file finishes
///
/// # Returns
///
/// - `1` if the load is complete
/// - `0` if `timeout_ms` elapsed first
/// - `-1` on invalid arguments
///
/// # Safety
///
/// `ptr` must be a valid store pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn detview_wait_loaded(ptr: *const DetviewStore, timeout_ms: u64) -> c_int {
    ffi_guard(|| {
        let Some(store) = (unsafe { store_ref(ptr) }) else {
            return -1;
        };
        c_int::from(store.wait_until_loaded(Duration::from_millis(timeout_ms)))
    })
    .unwrap_or(-1)
}

//
// === QUERIES ===
//

/// Number of records ingested so far (0 for NULL or an unopened store)
///
/// # Safety
///
/// `ptr` must be NULL or a valid store pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn detview_num_records(ptr: *const DetviewStore) -> u32 {
    ffi_guard(|| {
        let Some(store) = (unsafe { store_ref(ptr) }) else {
            return 0;
        };
        store.num_records()
    })
    .unwrap_or(0)
}

/// Write the image path of record `index` into `buf`
///
/// # Returns
///
/// - Path length in bytes (without the NUL terminator)
/// - `-1` on failure
///
/// The path is written only if `buf_len` exceeds the returned length;
/// otherwise call again with a bigger buffer. `buf` may be NULL when
/// `buf_len` is 0.
///
/// # Example (C)
///
/// ```c
/// char path[4096];
/// int64_t n = detview_item_path(store, 42, path, sizeof(path));
/// if (n >= 0 && (size_t)n < sizeof(path)) {
///     load_image(path);
/// }
/// ```
///
/// # Safety
///
/// - `ptr` must be a valid store pointer
/// - `buf` must point to at least `buf_len` writable bytes
#[unsafe(no_mangle)]
pub unsafe extern "C" fn detview_item_path(
    ptr: *const DetviewStore,
    index: u32,
    buf: *mut c_char,
    buf_len: size_t,
) -> i64 {
    ffi_guard(|| {
        let Some(store) = (unsafe { store_ref(ptr) }) else {
            return -1;
        };
        if buf.is_null() && buf_len > 0 {
            set_last_error("Buffer cannot be NULL");
            return -1;
        }

        let path = match store.item_path(index) {
            Ok(path) => path,
            Err(e) => {
                set_last_error(format!("{:#}", e));
                return -1;
            }
        };
        let Some(path_str) = path.to_str() else {
            set_last_error("Item path is not valid UTF-8");
            return -1;
        };

        let bytes = path_str.as_bytes();
        if bytes.len() < buf_len {
            // SAFETY: buf holds buf_len > bytes.len() bytes, leaving room for the NUL
            let out = unsafe { slice::from_raw_parts_mut(buf as *mut u8, buf_len) };
            out[..bytes.len()].copy_from_slice(bytes);
            out[bytes.len()] = 0;
        }
        clear_last_error();
        i64::try_from(bytes.len()).unwrap_or(i64::MAX)
    })
    .unwrap_or(-1)
}

/// Copy the per-record counts of monitored class `class_idx` into `out`
///
/// # Returns
///
/// - Total number of counts available (at most `out_len` are copied)
/// - `-1` on failure
///
/// `out` may be NULL when `out_len` is 0, to query the length.
///
/// # Safety
///
/// - `ptr` must be a valid store pointer
/// - `out` must point to at least `out_len` writable bytes
#[unsafe(no_mangle)]
pub unsafe extern "C" fn detview_num_detections(
    ptr: *const DetviewStore,
    class_idx: size_t,
    out: *mut i8,
    out_len: size_t,
) -> i64 {
    ffi_guard(|| {
        let Some(store) = (unsafe { store_ref(ptr) }) else {
            return -1;
        };
        if out.is_null() && out_len > 0 {
            set_last_error("Output buffer cannot be NULL");
            return -1;
        }
        if class_idx >= store.options().monitored_classes.len() {
            set_last_error(format!("Class index {} is not monitored", class_idx));
            return -1;
        }

        let counts = store.num_detections(class_idx);
        let copied = counts.len().min(out_len);
        if copied > 0 {
            // SAFETY: Caller guarantees out has out_len >= copied elements
            let dst = unsafe { slice::from_raw_parts_mut(out, copied) };
            dst.copy_from_slice(&counts[..copied]);
        }
        clear_last_error();
        i64::try_from(counts.len()).unwrap_or(i64::MAX)
    })
    .unwrap_or(-1)
}

/// Next point of interest after `index`, or the record count if none
///
/// # Safety
///
/// `ptr` must be NULL or a valid store pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn detview_next_poi(ptr: *const DetviewStore, index: u32) -> u32 {
    ffi_guard(|| {
        let Some(store) = (unsafe { store_ref(ptr) }) else {
            return 0;
        };
        store.next_poi(index)
    })
    .unwrap_or(0)
}

/// Previous point of interest before `index`, or 0 if none
///
/// # Safety
///
/// `ptr` must be NULL or a valid store pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn detview_prev_poi(ptr: *const DetviewStore, index: u32) -> u32 {
    ffi_guard(|| {
        let Some(store) = (unsafe { store_ref(ptr) }) else {
            return 0;
        };
        store.prev_poi(index)
    })
    .unwrap_or(0)
}

//
// === ERROR HANDLING ===
//

/// Get the last error message for the current thread
///
/// # Returns
///
/// - Pointer to NUL-terminated error string
/// - NULL if no error occurred
///
/// # Lifetime
///
/// The returned pointer is valid until the next FFI call on this thread.
/// **Do NOT** free the returned pointer.
#[unsafe(no_mangle)]
pub extern "C" fn detview_last_error_message() -> *const c_char {
    LAST_ERROR.with(|cell| cell.borrow().as_ref().map(|s| s.as_ptr()).unwrap_or(ptr::null()))
}

//
// === VERSIONING & LOGGING ===
//

/// Get the detview library version
///
/// The returned pointer is valid for the lifetime of the program.
#[unsafe(no_mangle)]
pub extern "C" fn detview_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

    VERSION.as_ptr() as *const c_char
}

/// Install a stderr log subscriber filtered by `RUST_LOG`
///
/// # Returns
///
/// - `0` if the subscriber was installed
/// - `-1` if a global subscriber already exists
#[unsafe(no_mangle)]
pub extern "C" fn detview_init_logging() -> c_int {
    ffi_guard(|| {
        let result = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
        match result {
            Ok(()) => {
                clear_last_error();
                tracing::debug!(version = env!("CARGO_PKG_VERSION"), "logging initialized");
                0
            }
            Err(e) => {
                set_last_error(e);
                -1
            }
        }
    })
    .unwrap_or(-1)
}

//
// === TESTS ===
//

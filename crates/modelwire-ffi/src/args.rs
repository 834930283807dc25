use std::ffi::CStr;
use std::os::raw::c_char;

use crate::error;
use crate::types::{CommHandle, MwCommHandle, MwMessage, MwResult};

/// Convert a required C string argument into UTF-8 `&str`.
///
/// # Safety
/// `value` must be null or point to a valid NUL-terminated C string.
pub(crate) unsafe fn required_str_arg<'a>(value: *const c_char, name: &str) -> Option<&'a str> {
    if value.is_null() {
        let _ = error::set_invalid_argument(format!("{name} cannot be null"));
        return None;
    }

    // SAFETY: The caller guarantees `value` points to a valid NUL-terminated C string.
    let as_cstr = unsafe { CStr::from_ptr(value) };
    match as_cstr.to_str() {
        Ok(v) => Some(v),
        Err(_) => {
            let _ = error::set_invalid_argument(format!("{name} must be valid UTF-8"));
            None
        }
    }
}

/// Convert an optional byte pointer + length into a slice.
///
/// # Safety
/// If `len > 0`, `data` must be non-null and readable for `len` bytes.
pub(crate) unsafe fn bytes_arg<'a>(data: *const u8, len: usize, name: &str) -> Option<&'a [u8]> {
    if len == 0 {
        return Some(&[]);
    }
    if data.is_null() {
        let _ = error::set_invalid_argument(format!("{name} cannot be null when len > 0"));
        return None;
    }

    // SAFETY: Pointer and length are validated above and owned by caller for the call duration.
    Some(unsafe { std::slice::from_raw_parts(data, len) })
}

pub(crate) fn with_handle<T>(
    handle: MwCommHandle,
    on_error: T,
    f: impl FnOnce(&mut CommHandle) -> T,
) -> T {
    if handle.is_null() {
        let _ = error::set_invalid_argument("comm handle cannot be null");
        return on_error;
    }

    // SAFETY: Pointer validity is guaranteed by the caller.
    let comm = unsafe { &mut *(handle as *mut CommHandle) };
    f(comm)
}

pub(crate) fn into_handle(comm: CommHandle) -> MwCommHandle {
    Box::into_raw(Box::new(comm)) as MwCommHandle
}

/// Hand `payload` to the caller through `out`, freeing what `out` held.
pub(crate) fn write_message_out(out: *mut MwMessage, payload: &[u8]) -> MwResult {
    if out.is_null() {
        return error::set_invalid_argument("out_message cannot be null");
    }

    // SAFETY: Pointer validity is guaranteed by the caller.
    let message = unsafe { &mut *out };
    free_message_data(message);

    let boxed: Box<[u8]> = payload.to_vec().into_boxed_slice();
    let len = boxed.len();
    message.data = if len == 0 {
        std::ptr::null_mut()
    } else {
        Box::into_raw(boxed) as *mut u8
    };
    message.len = len;
    MwResult::Ok
}

pub(crate) fn free_message_data(message: &mut MwMessage) {
    if !message.data.is_null() {
        let slice = std::ptr::slice_from_raw_parts_mut(message.data, message.len);
        // SAFETY: `data` was allocated as a `Box<[u8]>` by `write_message_out`.
        unsafe {
            drop(Box::from_raw(slice));
        }
    }
    *message = MwMessage::default();
}

use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::c_char;

use modelwire_comm::CommError;

use crate::types::MwResult;

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

pub(crate) fn clear_error_state() {
    LAST_ERROR.with(|state| {
        *state.borrow_mut() = CString::default();
    });
}

pub(crate) fn set_error_message(message: impl Into<String>) {
    let sanitized = message.into().replace('\0', "?");
    LAST_ERROR.with(|state| {
        *state.borrow_mut() = CString::new(sanitized).unwrap_or_default();
    });
}

pub(crate) fn set_invalid_argument(message: impl Into<String>) -> MwResult {
    set_error_message(message);
    MwResult::InvalidArgument
}

pub(crate) fn set_panic_error() {
    set_error_message("panic across FFI boundary");
}

pub(crate) fn map_comm_error(err: &CommError) -> MwResult {
    set_error_message(err.to_string());
    if err.is_framing() {
        return MwResult::FrameError;
    }
    match err {
        CommError::Transport(_) | CommError::Io(_) | CommError::Registration(_) => {
            MwResult::TransportError
        }
        CommError::Frame(_) => MwResult::TransportError,
        CommError::Json(_) | CommError::InvalidAddress(_) | CommError::WrongDirection { .. } => {
            MwResult::InvalidArgument
        }
        CommError::MissingEndpoint { .. } => MwResult::NotConfigured,
        CommError::Broken(_) => MwResult::Broken,
        CommError::Closed(_) => MwResult::Closed,
        CommError::RecvTimeout { .. } => MwResult::Timeout,
        CommError::RpcTimeout(_) => MwResult::RpcTimeout,
    }
}

pub(crate) fn last_error_ptr() -> *const c_char {
    LAST_ERROR.with(|state| state.borrow().as_ptr())
}

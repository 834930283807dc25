use std::os::raw::c_char;

use modelwire_comm::{CommDriver, Received, RecvPolicy};

use crate::args::{self, with_handle};
use crate::error;
use crate::types::{CommHandle, MwCommHandle, MwMessage, MwResult};

fn open(
    endpoint: *const c_char,
    opener: fn(&str) -> modelwire_comm::Result<Box<dyn CommDriver>>,
) -> MwCommHandle {
    error::clear_error_state();

    // SAFETY: We validate null and UTF-8 in helper.
    let Some(endpoint) = (unsafe { args::required_str_arg(endpoint, "endpoint") }) else {
        return std::ptr::null_mut();
    };

    match opener(endpoint) {
        Ok(driver) => args::into_handle(CommHandle::Channel {
            driver,
            recv: RecvPolicy::from_env(),
        }),
        Err(err) => {
            let _ = error::map_comm_error(&err);
            std::ptr::null_mut()
        }
    }
}

fn with_driver(
    handle: MwCommHandle,
    f: impl FnOnce(&mut dyn CommDriver, &RecvPolicy) -> MwResult,
) -> MwResult {
    with_handle(handle, MwResult::InvalidArgument, |comm| match comm {
        CommHandle::Channel { driver, recv } => f(&mut **driver, recv),
        other => error::set_invalid_argument(format!("{} handle is not a channel", other.kind())),
    })
}

/// Open the input endpoint `endpoint` injected by the orchestrator.
///
/// # Safety
/// `endpoint` must be a non-null pointer to a valid UTF-8, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn mw_input_open(endpoint: *const c_char) -> MwCommHandle {
    crate::ffi_boundary(std::ptr::null_mut(), || {
        open(endpoint, modelwire_comm::open_input)
    })
}

/// Open the output endpoint `endpoint` injected by the orchestrator.
///
/// # Safety
/// `endpoint` must be a non-null pointer to a valid UTF-8, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn mw_output_open(endpoint: *const c_char) -> MwCommHandle {
    crate::ffi_boundary(std::ptr::null_mut(), || {
        open(endpoint, modelwire_comm::open_output)
    })
}

/// Send one message. A zero-length message is a heartbeat.
///
/// # Safety
/// `comm` must be a handle from `mw_output_open`. If `len > 0`, `data` must be non-null and
/// readable for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn mw_send(comm: MwCommHandle, data: *const u8, len: usize) -> MwResult {
    crate::ffi_boundary(MwResult::Internal, || {
        error::clear_error_state();

        // SAFETY: We validate pointer/length pairing in helper.
        let Some(payload) = (unsafe { args::bytes_arg(data, len, "data") }) else {
            return MwResult::InvalidArgument;
        };

        with_driver(comm, |driver, _| match driver.send(payload) {
            Ok(()) => MwResult::Ok,
            Err(err) => error::map_comm_error(&err),
        })
    })
}

/// Tell the receiving side no more messages follow.
///
/// # Safety
/// `comm` must be a handle from `mw_output_open`.
#[no_mangle]
pub unsafe extern "C" fn mw_send_eof(comm: MwCommHandle) -> MwResult {
    crate::ffi_boundary(MwResult::Internal, || {
        error::clear_error_state();

        with_driver(comm, |driver, _| match driver.send_eof() {
            Ok(()) => MwResult::Ok,
            Err(err) => error::map_comm_error(&err),
        })
    })
}

/// Receive the next message into `out_message`.
///
/// Returns `MW_EOF` once the sender has finished. Waits follow the receive
/// timeout injected by the orchestrator, blocking when none was set.
///
/// # Safety
/// `comm` must be a handle from `mw_input_open` and `out_message` a valid writable pointer.
/// If `out_message->data` already holds a payload from this library, it is freed first.
#[no_mangle]
pub unsafe extern "C" fn mw_recv(comm: MwCommHandle, out_message: *mut MwMessage) -> MwResult {
    crate::ffi_boundary(MwResult::Internal, || {
        error::clear_error_state();

        with_driver(comm, |driver, recv| match recv.recv(driver) {
            Ok(Received::Message(payload)) => args::write_message_out(out_message, &payload),
            Ok(Received::Eof) => MwResult::Eof,
            Ok(Received::Timeout) => {
                error::set_error_message("receive timed out");
                MwResult::Timeout
            }
            Err(err) => error::map_comm_error(&err),
        })
    })
}

/// Close and free a handle from any `mw_*_open` function.
///
/// Outputs send EOF if they have not already.
///
/// # Safety
/// `comm` must be null or a handle returned by this library, not used afterwards.
#[no_mangle]
pub unsafe extern "C" fn mw_comm_free(comm: MwCommHandle) {
    crate::ffi_boundary((), || {
        if comm.is_null() {
            return;
        }
        // SAFETY: Caller guarantees this handle was allocated by this library.
        let mut comm = unsafe { Box::from_raw(comm as *mut CommHandle) };
        let closed = match comm.as_mut() {
            CommHandle::Channel { driver, .. } => driver.close(),
            CommHandle::RpcClient(client) => client.close(),
            CommHandle::RpcServer(server) => server.close(),
        };
        if let Err(err) = closed {
            let _ = error::map_comm_error(&err);
        }
    });
}

/// Free payload memory held by a message filled by `mw_recv` or `mw_rpc_call`.
///
/// # Safety
/// `message` must be null or a valid pointer. If `message->data` is non-null, it must have
/// originated from this library.
#[no_mangle]
pub unsafe extern "C" fn mw_message_free(message: *mut MwMessage) {
    crate::ffi_boundary((), || {
        if message.is_null() {
            return;
        }
        // SAFETY: Pointer validity is guaranteed by the caller.
        args::free_message_data(unsafe { &mut *message });
    });
}

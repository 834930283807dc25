use std::ffi::c_void;
use std::os::raw::c_char;

use modelwire_comm::{Received, RpcClient, RpcServer};

use crate::args::{self, with_handle};
use crate::error;
use crate::types::{CommHandle, MwCommHandle, MwMessage, MwResult, MwRpcHandler};

/// Open the calling side of RPC service `service`.
///
/// # Safety
/// `service` must be a non-null pointer to a valid UTF-8, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn mw_rpc_client_open(service: *const c_char) -> MwCommHandle {
    crate::ffi_boundary(std::ptr::null_mut(), || {
        error::clear_error_state();

        // SAFETY: We validate null and UTF-8 in helper.
        let Some(service) = (unsafe { args::required_str_arg(service, "service") }) else {
            return std::ptr::null_mut();
        };
        match RpcClient::connect(service) {
            Ok(client) => args::into_handle(CommHandle::RpcClient(client)),
            Err(err) => {
                let _ = error::map_comm_error(&err);
                std::ptr::null_mut()
            }
        }
    })
}

/// Send a request and wait for its response.
///
/// # Safety
/// `client` must be a handle from `mw_rpc_client_open`. If `len > 0`, `data` must be non-null
/// and readable for `len` bytes. `out_message` must be a valid writable pointer.
#[no_mangle]
pub unsafe extern "C" fn mw_rpc_call(
    client: MwCommHandle,
    data: *const u8,
    len: usize,
    out_message: *mut MwMessage,
) -> MwResult {
    crate::ffi_boundary(MwResult::Internal, || {
        error::clear_error_state();

        // SAFETY: We validate pointer/length pairing in helper.
        let Some(request) = (unsafe { args::bytes_arg(data, len, "data") }) else {
            return MwResult::InvalidArgument;
        };
        with_handle(client, MwResult::InvalidArgument, |comm| match comm {
            CommHandle::RpcClient(client) => match client.call(request) {
                Ok(response) => args::write_message_out(out_message, &response),
                Err(err) => error::map_comm_error(&err),
            },
            other => error::set_invalid_argument(format!("{} handle is not an rpc client", other.kind())),
        })
    })
}

/// Open the serving side of RPC service `service`.
///
/// # Safety
/// `service` must be a non-null pointer to a valid UTF-8, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn mw_rpc_server_open(service: *const c_char) -> MwCommHandle {
    crate::ffi_boundary(std::ptr::null_mut(), || {
        error::clear_error_state();

        // SAFETY: We validate null and UTF-8 in helper.
        let Some(service) = (unsafe { args::required_str_arg(service, "service") }) else {
            return std::ptr::null_mut();
        };
        match RpcServer::connect(service) {
            Ok(server) => args::into_handle(CommHandle::RpcServer(server)),
            Err(err) => {
                let _ = error::map_comm_error(&err);
                std::ptr::null_mut()
            }
        }
    })
}

/// Answer requests with `handler` until the client finishes.
///
/// Writes the number of requests answered to `out_served` when it is
/// non-null. A non-zero handler return stops serving with `MW_ERR_INTERNAL`.
///
/// # Safety
/// `server` must be a handle from `mw_rpc_server_open`, `handler` a valid function pointer,
/// and `out_served` null or writable. `user_data` is passed through untouched.
#[no_mangle]
pub unsafe extern "C" fn mw_rpc_serve(
    server: MwCommHandle,
    handler: MwRpcHandler,
    user_data: *mut c_void,
    out_served: *mut u64,
) -> MwResult {
    crate::ffi_boundary(MwResult::Internal, || {
        error::clear_error_state();

        let Some(handler) = handler else {
            return error::set_invalid_argument("handler cannot be null");
        };
        with_handle(server, MwResult::InvalidArgument, |comm| {
            let CommHandle::RpcServer(server) = comm else {
                return error::set_invalid_argument(format!(
                    "{} handle is not an rpc server",
                    comm.kind()
                ));
            };

            let mut served = 0u64;
            let result = loop {
                let request = match server.recv_request(None) {
                    Ok(Received::Message(request)) => request,
                    Ok(Received::Eof) => break MwResult::Ok,
                    Ok(Received::Timeout) => continue,
                    Err(err) => break error::map_comm_error(&err),
                };

                let mut response: *const u8 = std::ptr::null();
                let mut response_len = 0usize;
                // SAFETY: The caller guarantees `handler` is callable with these arguments.
                let rc = unsafe {
                    handler(
                        user_data,
                        request.as_ptr(),
                        request.len(),
                        &mut response,
                        &mut response_len,
                    )
                };
                if rc != 0 {
                    error::set_error_message(format!("rpc handler returned {rc}"));
                    break MwResult::Internal;
                }
                // SAFETY: The handler owns `response` for `response_len` bytes until we return.
                let Some(payload) = (unsafe { args::bytes_arg(response, response_len, "response") })
                else {
                    break MwResult::InvalidArgument;
                };
                if let Err(err) = server.send_response(payload) {
                    break error::map_comm_error(&err);
                }
                served += 1;
            };

            if !out_served.is_null() {
                // SAFETY: Checked non-null; the caller guarantees it is writable.
                unsafe { *out_served = served };
            }
            result
        })
    })
}

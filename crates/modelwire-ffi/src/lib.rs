//! modelwire-ffi: C ABI for models written in compiled languages.
//!
//! Endpoints are opened by name from the addresses the orchestrator
//! injects (`mw_input_open`, `mw_output_open`, `mw_rpc_client_open`,
//! `mw_rpc_server_open`). Every call returns an `MwResult`; details of the
//! last failure on the calling thread are available from `mw_last_error`.

mod args;
mod channel;
mod error;
mod rpc;
mod types;

use std::panic::AssertUnwindSafe;

pub use channel::{
    mw_comm_free, mw_input_open, mw_message_free, mw_output_open, mw_recv, mw_send, mw_send_eof,
};
pub use rpc::{mw_rpc_call, mw_rpc_client_open, mw_rpc_serve, mw_rpc_server_open};
pub use types::{
    MwCommHandle, MwMessage, MwResult, MwRpcHandler, MW_EOF, MW_ERR_BROKEN, MW_ERR_CLOSED,
    MW_ERR_FRAME, MW_ERR_INTERNAL, MW_ERR_INVALID_ARGUMENT, MW_ERR_NOT_CONFIGURED,
    MW_ERR_RPC_TIMEOUT, MW_ERR_TIMEOUT, MW_ERR_TRANSPORT, MW_OK,
};

fn ffi_boundary<T>(on_panic: T, f: impl FnOnce() -> T) -> T {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            error::set_panic_error();
            on_panic
        }
    }
}

/// Message describing the last failure on this thread, empty after success.
#[no_mangle]
pub extern "C" fn mw_last_error() -> *const std::os::raw::c_char {
    ffi_boundary(std::ptr::null(), error::last_error_ptr)
}

#[cfg(test)]
mod tests {
    use std::ffi::{c_void, CStr, CString};

    use super::*;

    fn last_error() -> String {
        // SAFETY: mw_last_error returns a pointer to a thread-local CString.
        unsafe { CStr::from_ptr(mw_last_error()) }
            .to_string_lossy()
            .into_owned()
    }

    fn inject(endpoint: &str, pipe: &str) {
        std::env::set_var(
            modelwire_comm::endpoint_env_var(endpoint),
            format!("pipe:{pipe}"),
        );
    }

    fn message_bytes(message: &MwMessage) -> Vec<u8> {
        if message.data.is_null() {
            return Vec::new();
        }
        // SAFETY: data/len were filled by this library.
        unsafe { std::slice::from_raw_parts(message.data, message.len) }.to_vec()
    }

    #[test]
    fn send_and_recv_through_injected_endpoints() {
        inject("ffi_stream", "ffi-stream");
        let name = CString::new("ffi_stream").unwrap();

        // SAFETY: valid C strings and handles from this library throughout.
        unsafe {
            let output = mw_output_open(name.as_ptr());
            let input = mw_input_open(name.as_ptr());
            assert!(!output.is_null() && !input.is_null(), "{}", last_error());

            assert_eq!(mw_send(output, b"hello".as_ptr(), 5), MwResult::Ok);
            assert_eq!(mw_send(output, std::ptr::null(), 0), MwResult::Ok);
            assert_eq!(mw_send_eof(output), MwResult::Ok);

            let mut message = MwMessage::default();
            assert_eq!(mw_recv(input, &mut message), MwResult::Ok);
            assert_eq!(message_bytes(&message), b"hello");
            assert_eq!(mw_recv(input, &mut message), MwResult::Ok);
            assert!(message.data.is_null());
            assert_eq!(message.len, 0);
            assert_eq!(mw_recv(input, &mut message), MwResult::Eof);

            mw_message_free(&mut message);
            mw_comm_free(output);
            mw_comm_free(input);
        }
    }

    #[test]
    fn missing_endpoint_is_reported() {
        let name = CString::new("ffi_never_injected").unwrap();
        // SAFETY: valid C string.
        let handle = unsafe { mw_input_open(name.as_ptr()) };
        assert!(handle.is_null());
        assert!(last_error().contains("MODELWIRE_EP_FFI_NEVER_INJECTED"));
    }

    #[test]
    fn null_arguments_are_rejected() {
        // SAFETY: null handles are checked before use.
        unsafe {
            assert!(mw_output_open(std::ptr::null()).is_null());
            assert_eq!(mw_send(std::ptr::null_mut(), b"x".as_ptr(), 1), MwResult::InvalidArgument);
            assert!(last_error().contains("null"));
            mw_comm_free(std::ptr::null_mut());
            mw_message_free(std::ptr::null_mut());
        }
    }

    unsafe extern "C" fn double(
        user_data: *mut c_void,
        request: *const u8,
        request_len: usize,
        response: *mut *const u8,
        response_len: *mut usize,
    ) -> i32 {
        // SAFETY: the test passes a Vec<u8> as user data and valid out pointers.
        unsafe {
            let buffer = &mut *(user_data as *mut Vec<u8>);
            let request = std::slice::from_raw_parts(request, request_len);
            buffer.clear();
            buffer.extend_from_slice(request);
            buffer.extend_from_slice(request);
            *response = buffer.as_ptr();
            *response_len = buffer.len();
        }
        0
    }

    #[test]
    fn rpc_round_trip() {
        inject("ffisvc.request", "ffisvc-request");
        inject("ffisvc.response", "ffisvc-response");
        let service = CString::new("ffisvc").unwrap();

        // SAFETY: valid C strings and handles from this library throughout.
        unsafe {
            let server = mw_rpc_server_open(service.as_ptr()) as usize;
            let client = mw_rpc_client_open(service.as_ptr());
            assert!(server != 0 && !client.is_null(), "{}", last_error());

            let serving = std::thread::spawn(move || {
                let mut scratch: Vec<u8> = Vec::new();
                let mut served = 0u64;
                let rc = mw_rpc_serve(
                    server as MwCommHandle,
                    Some(double),
                    &mut scratch as *mut Vec<u8> as *mut c_void,
                    &mut served,
                );
                mw_comm_free(server as MwCommHandle);
                (rc, served)
            });

            let mut message = MwMessage::default();
            assert_eq!(mw_rpc_call(client, b"ab".as_ptr(), 2, &mut message), MwResult::Ok);
            assert_eq!(message_bytes(&message), b"abab");
            assert_eq!(mw_rpc_call(client, b"c".as_ptr(), 1, &mut message), MwResult::Ok);
            assert_eq!(message_bytes(&message), b"cc");
            mw_message_free(&mut message);
            mw_comm_free(client);

            assert_eq!(serving.join().unwrap(), (MwResult::Ok, 2));
        }
    }

    #[test]
    fn channel_calls_reject_rpc_handles() {
        inject("ffiwrong.request", "ffiwrong-request");
        inject("ffiwrong.response", "ffiwrong-response");
        let service = CString::new("ffiwrong").unwrap();

        // SAFETY: valid C string and handle from this library.
        unsafe {
            let client = mw_rpc_client_open(service.as_ptr());
            assert!(!client.is_null(), "{}", last_error());
            assert_eq!(mw_send(client, b"x".as_ptr(), 1), MwResult::InvalidArgument);
            assert!(last_error().contains("rpc client"));
            mw_comm_free(client);
        }
    }
}

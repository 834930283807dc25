use std::ffi::c_void;

use modelwire_comm::{CommDriver, RecvPolicy, RpcClient, RpcServer};

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MwResult {
    Ok = 0,
    InvalidArgument = 1,
    TransportError = 2,
    FrameError = 3,
    /// The peer finished; no more messages will arrive.
    Eof = 4,
    Timeout = 5,
    RpcTimeout = 6,
    Broken = 7,
    /// The endpoint's address was not injected into this process.
    NotConfigured = 8,
    Closed = 9,
    Internal = 99,
}

pub const MW_OK: MwResult = MwResult::Ok;
pub const MW_ERR_INVALID_ARGUMENT: MwResult = MwResult::InvalidArgument;
pub const MW_ERR_TRANSPORT: MwResult = MwResult::TransportError;
pub const MW_ERR_FRAME: MwResult = MwResult::FrameError;
pub const MW_EOF: MwResult = MwResult::Eof;
pub const MW_ERR_TIMEOUT: MwResult = MwResult::Timeout;
pub const MW_ERR_RPC_TIMEOUT: MwResult = MwResult::RpcTimeout;
pub const MW_ERR_BROKEN: MwResult = MwResult::Broken;
pub const MW_ERR_NOT_CONFIGURED: MwResult = MwResult::NotConfigured;
pub const MW_ERR_CLOSED: MwResult = MwResult::Closed;
pub const MW_ERR_INTERNAL: MwResult = MwResult::Internal;

/// A received message. Free `data` with `mw_message_free`.
#[repr(C)]
#[derive(Debug)]
pub struct MwMessage {
    pub data: *mut u8,
    pub len: usize,
}

impl Default for MwMessage {
    fn default() -> Self {
        Self {
            data: std::ptr::null_mut(),
            len: 0,
        }
    }
}

pub type MwCommHandle = *mut c_void;

/// Answers one RPC request.
///
/// The handler points `*response` at `*response_len` bytes it owns; they
/// are copied before the next request is read. A non-zero return stops
/// serving.
pub type MwRpcHandler = Option<
    unsafe extern "C" fn(
        user_data: *mut c_void,
        request: *const u8,
        request_len: usize,
        response: *mut *const u8,
        response_len: *mut usize,
    ) -> i32,
>;

pub(crate) enum CommHandle {
    Channel {
        driver: Box<dyn CommDriver>,
        recv: RecvPolicy,
    },
    RpcClient(RpcClient),
    RpcServer(RpcServer),
}

impl CommHandle {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            CommHandle::Channel { .. } => "channel",
            CommHandle::RpcClient(_) => "rpc client",
            CommHandle::RpcServer(_) => "rpc server",
        }
    }
}

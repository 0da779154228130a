use gfxbridge_server::ServerError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub fn code_for(err: &ServerError) -> i32 {
    match err {
        ServerError::Handshake(_) => TIMEOUT,
        ServerError::Shm(_) => TRANSPORT_ERROR,
        ServerError::Wire(_) | ServerError::MalformedPayload { .. } => DATA_INVALID,
        ServerError::UnknownHandle(_) => DATA_INVALID,
        ServerError::Channel(err) if err.is_fatal() => FAILURE,
        _ => INTERNAL,
    }
}

//! Response envelope for the Control API

use cpe_core::Error;
use serde::{Deserialize, Serialize};

pub const CODE_OK: &str = "200";
pub const CODE_BAD_REQUEST: &str = "400";
pub const CODE_ERROR: &str = "500";

/// `{success, code, msg}`, returned with HTTP 200 for every handled call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub code: String,
    pub msg: String,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            code: CODE_OK.to_string(),
            msg: "success".to_string(),
        }
    }

    pub fn failure(code: &str, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            code: code.to_string(),
            msg: msg.into(),
        }
    }

    /// Map a core error onto the envelope
    ///
    /// A serial mismatch is reported as "500" even though the caller caused it.
    pub fn from_error(err: &Error) -> Self {
        let code = match err {
            Error::SerialMismatch(_) => CODE_ERROR,
            e if e.is_validation() => CODE_BAD_REQUEST,
            _ => CODE_ERROR,
        };
        Self::failure(code, err.to_string())
    }
}

impl From<cpe_core::Result<()>> for ApiResponse {
    fn from(result: cpe_core::Result<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::from_error(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(ApiResponse::from_error(&Error::SerialMismatch("SN9".into())).code, "500");
        assert_eq!(ApiResponse::from_error(&Error::not_found("/port/lan9")).code, "400");
        assert_eq!(ApiResponse::from_error(&Error::invalid_input("bad cidr")).code, "400");
        assert_eq!(ApiResponse::from_error(&Error::command("ip link", "no such device")).code, "500");
        assert_eq!(ApiResponse::from(Ok(())), ApiResponse::ok());
    }
}

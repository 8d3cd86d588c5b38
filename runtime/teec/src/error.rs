//! Result vocabulary of the client API
//!
//! Every failure carries the code and the layer that produced it
//! ([`ReturnOrigin`]). Only communication- and secure-world-origin failures
//! break a session; trusted-application codes are ordinary results.

use core::fmt;

use kaal_tci::codes::*;
use thiserror::Error;

/// Layer that produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnOrigin {
    /// The client API itself (parameter and state checks)
    Api,
    /// Driver and transport
    Comms,
    /// Secure-world OS
    Tee,
    /// The trusted application
    TrustedApp,
}

impl ReturnOrigin {
    pub const fn code(self) -> u32 {
        match self {
            Self::Api => TEEC_ORIGIN_API,
            Self::Comms => TEEC_ORIGIN_COMMS,
            Self::Tee => TEEC_ORIGIN_TEE,
            Self::TrustedApp => TEEC_ORIGIN_TRUSTED_APP,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            TEEC_ORIGIN_API => Some(Self::Api),
            TEEC_ORIGIN_COMMS => Some(Self::Comms),
            TEEC_ORIGIN_TEE => Some(Self::Tee),
            TEEC_ORIGIN_TRUSTED_APP => Some(Self::TrustedApp),
            _ => None,
        }
    }
}

impl fmt::Display for ReturnOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Api => "api",
            Self::Comms => "comms",
            Self::Tee => "tee",
            Self::TrustedApp => "trusted app",
        })
    }
}

/// Failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    #[error("generic error")]
    Generic,
    #[error("access denied")]
    AccessDenied,
    #[error("operation cancelled")]
    Cancel,
    #[error("access conflict")]
    AccessConflict,
    #[error("excess data")]
    ExcessData,
    #[error("bad format")]
    BadFormat,
    #[error("bad parameters")]
    BadParameters,
    #[error("bad state")]
    BadState,
    #[error("item not found")]
    ItemNotFound,
    #[error("not implemented")]
    NotImplemented,
    #[error("not supported")]
    NotSupported,
    #[error("no data")]
    NoData,
    #[error("out of memory")]
    OutOfMemory,
    #[error("busy")]
    Busy,
    #[error("communication error")]
    Communication,
    #[error("security error")]
    Security,
    #[error("short buffer")]
    ShortBuffer,
    #[error("target dead")]
    TargetDead,
    #[error("trusted application locked")]
    TaLocked,
    #[error("security domain blocked")]
    SdBlocked,
    #[error("target killed")]
    TargetKilled,
    /// Code defined by the trusted application
    #[error("error {0:#010x}")]
    Other(u32),
}

impl ErrorKind {
    pub const fn code(self) -> u32 {
        match self {
            Self::Generic => TEEC_ERROR_GENERIC,
            Self::AccessDenied => TEEC_ERROR_ACCESS_DENIED,
            Self::Cancel => TEEC_ERROR_CANCEL,
            Self::AccessConflict => TEEC_ERROR_ACCESS_CONFLICT,
            Self::ExcessData => TEEC_ERROR_EXCESS_DATA,
            Self::BadFormat => TEEC_ERROR_BAD_FORMAT,
            Self::BadParameters => TEEC_ERROR_BAD_PARAMETERS,
            Self::BadState => TEEC_ERROR_BAD_STATE,
            Self::ItemNotFound => TEEC_ERROR_ITEM_NOT_FOUND,
            Self::NotImplemented => TEEC_ERROR_NOT_IMPLEMENTED,
            Self::NotSupported => TEEC_ERROR_NOT_SUPPORTED,
            Self::NoData => TEEC_ERROR_NO_DATA,
            Self::OutOfMemory => TEEC_ERROR_OUT_OF_MEMORY,
            Self::Busy => TEEC_ERROR_BUSY,
            Self::Communication => TEEC_ERROR_COMMUNICATION,
            Self::Security => TEEC_ERROR_SECURITY,
            Self::ShortBuffer => TEEC_ERROR_SHORT_BUFFER,
            Self::TargetDead => TEEC_ERROR_TARGET_DEAD,
            Self::TaLocked => TEEC_ERROR_TA_LOCKED,
            Self::SdBlocked => TEEC_ERROR_SD_BLOCKED,
            Self::TargetKilled => TEEC_ERROR_TARGET_KILLED,
            Self::Other(code) => code,
        }
    }

    /// Classify a non-success status code
    pub const fn from_code(code: u32) -> Self {
        match code {
            TEEC_ERROR_GENERIC => Self::Generic,
            TEEC_ERROR_ACCESS_DENIED => Self::AccessDenied,
            TEEC_ERROR_CANCEL => Self::Cancel,
            TEEC_ERROR_ACCESS_CONFLICT => Self::AccessConflict,
            TEEC_ERROR_EXCESS_DATA => Self::ExcessData,
            TEEC_ERROR_BAD_FORMAT => Self::BadFormat,
            TEEC_ERROR_BAD_PARAMETERS => Self::BadParameters,
            TEEC_ERROR_BAD_STATE => Self::BadState,
            TEEC_ERROR_ITEM_NOT_FOUND => Self::ItemNotFound,
            TEEC_ERROR_NOT_IMPLEMENTED => Self::NotImplemented,
            TEEC_ERROR_NOT_SUPPORTED => Self::NotSupported,
            TEEC_ERROR_NO_DATA => Self::NoData,
            TEEC_ERROR_OUT_OF_MEMORY => Self::OutOfMemory,
            TEEC_ERROR_BUSY => Self::Busy,
            TEEC_ERROR_COMMUNICATION => Self::Communication,
            TEEC_ERROR_SECURITY => Self::Security,
            TEEC_ERROR_SHORT_BUFFER => Self::ShortBuffer,
            TEEC_ERROR_TARGET_DEAD => Self::TargetDead,
            TEEC_ERROR_TA_LOCKED => Self::TaLocked,
            TEEC_ERROR_SD_BLOCKED => Self::SdBlocked,
            TEEC_ERROR_TARGET_KILLED => Self::TargetKilled,
            other => Self::Other(other),
        }
    }
}

/// A failed call: what went wrong and which layer said so
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} (origin: {origin})")]
pub struct TeecError {
    kind: ErrorKind,
    origin: ReturnOrigin,
}

impl TeecError {
    pub const fn new(kind: ErrorKind, origin: ReturnOrigin) -> Self {
        Self { kind, origin }
    }

    /// Parameter or state error raised by the client API
    pub const fn api(kind: ErrorKind) -> Self {
        Self::new(kind, ReturnOrigin::Api)
    }

    /// Failure of the driver or transport
    pub const fn comms(kind: ErrorKind) -> Self {
        Self::new(kind, ReturnOrigin::Comms)
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub const fn origin(&self) -> ReturnOrigin {
        self.origin
    }

    /// Raw status code
    pub const fn code(&self) -> u32 {
        self.kind.code()
    }

    /// Whether the failure leaves the session unusable
    pub fn breaks_session(&self) -> bool {
        matches!(self.origin, ReturnOrigin::Comms | ReturnOrigin::Tee)
    }
}

pub type Result<T> = core::result::Result<T, TeecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in [
            TEEC_ERROR_GENERIC,
            TEEC_ERROR_CANCEL,
            TEEC_ERROR_BAD_PARAMETERS,
            TEEC_ERROR_SHORT_BUFFER,
            TEEC_ERROR_TARGET_DEAD,
            TEEC_ERROR_TARGET_KILLED,
            0x1234,
        ] {
            assert_eq!(ErrorKind::from_code(code).code(), code);
        }
        assert_eq!(ErrorKind::from_code(0xCAFE), ErrorKind::Other(0xCAFE));
    }

    #[test]
    fn test_origins() {
        for origin in [
            ReturnOrigin::Api,
            ReturnOrigin::Comms,
            ReturnOrigin::Tee,
            ReturnOrigin::TrustedApp,
        ] {
            assert_eq!(ReturnOrigin::from_code(origin.code()), Some(origin));
        }
        assert_eq!(ReturnOrigin::from_code(0), None);
    }

    #[test]
    fn test_breaks_session() {
        assert!(TeecError::comms(ErrorKind::Communication).breaks_session());
        assert!(TeecError::new(ErrorKind::TargetDead, ReturnOrigin::Tee).breaks_session());
        assert!(!TeecError::api(ErrorKind::BadParameters).breaks_session());
        assert!(!TeecError::new(ErrorKind::Other(7), ReturnOrigin::TrustedApp).breaks_session());
    }

    #[test]
    fn test_display() {
        let error = TeecError::api(ErrorKind::BadState);
        assert_eq!(error.to_string(), "bad state (origin: api)");
    }
}

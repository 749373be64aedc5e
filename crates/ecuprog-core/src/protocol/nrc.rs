//! Negative response codes relevant to programming sessions

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLength,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    UploadDownloadNotAccepted,
    TransferDataSuspended,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,
    /// Request accepted, final response follows later
    ResponsePending,
    ServiceNotSupportedInActiveSession,
    Other(u8),
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLength,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceededNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x70 => Self::UploadDownloadNotAccepted,
            0x71 => Self::TransferDataSuspended,
            0x72 => Self::GeneralProgrammingFailure,
            0x73 => Self::WrongBlockSequenceCounter,
            0x78 => Self::ResponsePending,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            other => Self::Other(other),
        }
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> u8 {
        match nrc {
            NegativeResponseCode::GeneralReject => 0x10,
            NegativeResponseCode::ServiceNotSupported => 0x11,
            NegativeResponseCode::SubFunctionNotSupported => 0x12,
            NegativeResponseCode::IncorrectMessageLength => 0x13,
            NegativeResponseCode::BusyRepeatRequest => 0x21,
            NegativeResponseCode::ConditionsNotCorrect => 0x22,
            NegativeResponseCode::RequestSequenceError => 0x24,
            NegativeResponseCode::RequestOutOfRange => 0x31,
            NegativeResponseCode::SecurityAccessDenied => 0x33,
            NegativeResponseCode::InvalidKey => 0x35,
            NegativeResponseCode::ExceededNumberOfAttempts => 0x36,
            NegativeResponseCode::RequiredTimeDelayNotExpired => 0x37,
            NegativeResponseCode::UploadDownloadNotAccepted => 0x70,
            NegativeResponseCode::TransferDataSuspended => 0x71,
            NegativeResponseCode::GeneralProgrammingFailure => 0x72,
            NegativeResponseCode::WrongBlockSequenceCounter => 0x73,
            NegativeResponseCode::ResponsePending => 0x78,
            NegativeResponseCode::ServiceNotSupportedInActiveSession => 0x7F,
            NegativeResponseCode::Other(code) => code,
        }
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::GeneralReject => "general reject",
            Self::ServiceNotSupported => "service not supported",
            Self::SubFunctionNotSupported => "sub-function not supported",
            Self::IncorrectMessageLength => "incorrect message length or format",
            Self::BusyRepeatRequest => "busy, repeat request",
            Self::ConditionsNotCorrect => "conditions not correct",
            Self::RequestSequenceError => "request sequence error",
            Self::RequestOutOfRange => "request out of range",
            Self::SecurityAccessDenied => "security access denied",
            Self::InvalidKey => "invalid key",
            Self::ExceededNumberOfAttempts => "exceeded number of attempts",
            Self::RequiredTimeDelayNotExpired => "required time delay not expired",
            Self::UploadDownloadNotAccepted => "upload/download not accepted",
            Self::TransferDataSuspended => "transfer data suspended",
            Self::GeneralProgrammingFailure => "general programming failure",
            Self::WrongBlockSequenceCounter => "wrong block sequence counter",
            Self::ResponsePending => "response pending",
            Self::ServiceNotSupportedInActiveSession => {
                "service not supported in active session"
            }
            Self::Other(code) => return write!(f, "NRC 0x{:02X}", code),
        };
        write!(f, "{} (0x{:02X})", text, u8::from(*self))
    }
}

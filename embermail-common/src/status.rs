//! SMTP reply codes (RFC 5321) and enhanced status codes (RFC 3463).

use core::fmt::{self, Display, Formatter};

/// A three-digit SMTP reply code.
#[repr(C, u32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    ConnectionError = 101,
    #[allow(clippy::enum_variant_names)]
    SystemStatus = 211,
    HelpMessage = 215,
    ServiceReady = 220,
    GoodBye = 221,
    AuthSuccessful = 235,
    Ok = 250,
    /// RFC 3207 §6.2: the server cannot verify the user, e.g. VRFY.
    CannotVerify = 252,
    AuthContinue = 334,
    StartMailInput = 354,
    Unavailable = 421,
    ActionUnavailable = 451,
    /// Quota exceeded: recipient count or message-rate cap reached.
    TooManyRecipients = 452,
    /// TLS or AUTH is temporarily unavailable.
    TemporarilyUnavailable = 454,
    SyntaxError = 500,
    SyntaxErrorInParameters = 501,
    NotImplemented = 502,
    InvalidCommandSequence = 503,
    AuthRequired = 530,
    AuthCredentialsInvalid = 535,
    Error = 550,
    ExceededStorage = 552,
    ParameterNotRecognised = 555,
    Unknown(u32),
}

impl Status {
    /// Checks if the status is a permanent rejection (5xx).
    #[must_use]
    pub fn is_permanent(self) -> bool {
        u32::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection (4xx).
    #[must_use]
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&u32::from(self))
    }
}

impl From<u32> for Status {
    fn from(value: u32) -> Self {
        match value {
            101 => Self::ConnectionError,
            211 => Self::SystemStatus,
            215 => Self::HelpMessage,
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            235 => Self::AuthSuccessful,
            250 => Self::Ok,
            252 => Self::CannotVerify,
            334 => Self::AuthContinue,
            354 => Self::StartMailInput,
            421 => Self::Unavailable,
            451 => Self::ActionUnavailable,
            452 => Self::TooManyRecipients,
            454 => Self::TemporarilyUnavailable,
            500 => Self::SyntaxError,
            501 => Self::SyntaxErrorInParameters,
            502 => Self::NotImplemented,
            503 => Self::InvalidCommandSequence,
            530 => Self::AuthRequired,
            535 => Self::AuthCredentialsInvalid,
            550 => Self::Error,
            552 => Self::ExceededStorage,
            555 => Self::ParameterNotRecognised,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        match value {
            Status::ConnectionError => 101,
            Status::SystemStatus => 211,
            Status::HelpMessage => 215,
            Status::ServiceReady => 220,
            Status::GoodBye => 221,
            Status::AuthSuccessful => 235,
            Status::Ok => 250,
            Status::CannotVerify => 252,
            Status::AuthContinue => 334,
            Status::StartMailInput => 354,
            Status::Unavailable => 421,
            Status::ActionUnavailable => 451,
            Status::TooManyRecipients => 452,
            Status::TemporarilyUnavailable => 454,
            Status::SyntaxError => 500,
            Status::SyntaxErrorInParameters => 501,
            Status::NotImplemented => 502,
            Status::InvalidCommandSequence => 503,
            Status::AuthRequired => 530,
            Status::AuthCredentialsInvalid => 535,
            Status::Error => 550,
            Status::ExceededStorage => 552,
            Status::ParameterNotRecognised => 555,
            Status::Unknown(v) => v,
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u32::from(*self))
    }
}

/// An RFC 3463 enhanced status code, e.g. `5.1.1` (bad destination mailbox).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl EnhancedStatusCode {
    #[must_use]
    pub const fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self {
            class,
            subject,
            detail,
        }
    }

    /// `2.0.0` — success, no further detail.
    pub const SUCCESS: Self = Self::new(2, 0, 0);
    /// `2.1.5` — destination mailbox valid.
    pub const MAILBOX_VALID: Self = Self::new(2, 1, 5);
    /// `4.7.0` — temporary security/policy failure.
    pub const TEMP_SECURITY: Self = Self::new(4, 7, 0);
    /// `4.7.1` — temporary delivery, insufficient resources along the path.
    pub const TEMP_UNAVAILABLE: Self = Self::new(4, 4, 1);
    /// `5.1.1` — bad destination mailbox address.
    pub const BAD_MAILBOX: Self = Self::new(5, 1, 1);
    /// `5.1.3` — bad destination mailbox address syntax.
    pub const BAD_MAILBOX_SYNTAX: Self = Self::new(5, 1, 3);
    /// `5.3.4` — message too big for the system.
    pub const MESSAGE_TOO_BIG: Self = Self::new(5, 3, 4);
    /// `4.5.3` — too many recipients for this transaction.
    pub const TOO_MANY_RECIPIENTS: Self = Self::new(4, 5, 3);
    /// `5.5.1` — invalid command.
    pub const INVALID_COMMAND: Self = Self::new(5, 5, 1);
    /// `5.5.2` — syntax error.
    pub const SYNTAX_ERROR: Self = Self::new(5, 5, 2);
    /// `5.5.4` — invalid command arguments.
    pub const INVALID_ARGUMENTS: Self = Self::new(5, 5, 4);
    /// `5.6.0` — other/undefined media error.
    pub const MEDIA_ERROR: Self = Self::new(5, 6, 0);
    /// `5.7.0` — other/undefined security/policy status.
    pub const POLICY_REJECTED: Self = Self::new(5, 7, 0);
    /// `5.7.1` — delivery not authorized, message refused.
    pub const NOT_AUTHORIZED: Self = Self::new(5, 7, 1);
    /// `5.7.8` — authentication credentials invalid.
    pub const AUTH_CREDENTIALS_INVALID: Self = Self::new(5, 7, 8);
}

impl Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

#[cfg(test)]
mod test {
    use super::{EnhancedStatusCode, Status};

    #[test]
    fn status() {
        assert!(Status::Error.is_permanent());
        assert!(!Status::Error.is_temporary());

        assert!(Status::Unavailable.is_temporary());
        assert!(!Status::Unavailable.is_permanent());

        assert_eq!(Status::from(550), Status::Error);
        assert_eq!(u32::from(Status::Error), 550);
    }

    #[test]
    fn round_trips_new_codes() {
        for code in [
            Status::AuthRequired,
            Status::AuthCredentialsInvalid,
            Status::ParameterNotRecognised,
            Status::CannotVerify,
            Status::AuthContinue,
            Status::TooManyRecipients,
        ] {
            assert_eq!(Status::from(u32::from(code)), code);
        }
    }

    #[test]
    fn enhanced_status_display() {
        assert_eq!(EnhancedStatusCode::BAD_MAILBOX.to_string(), "5.1.1");
        assert_eq!(EnhancedStatusCode::SUCCESS.to_string(), "2.0.0");
    }
}

//! ESMTP extensions advertised in the EHLO response (RFC 5321 section 4.1.1.1
//! onward, plus RFC 1870, 1652/6152, 3030, 3461, 2034, 4954, 1985).

use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::session::TlsContext;

/// A capability this listener may advertise to a greeting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extension {
    /// STARTTLS is offered; carries the certificate/key paths needed to
    /// perform the in-place upgrade.
    Starttls(TlsContext),
    Help,
    /// The declared maximum message size in octets (RFC 1870).
    Size(usize),
    Pipelining,
    EightBitMime,
    Smtputf8,
    Chunking,
    Binarymime,
    Dsn,
    EnhancedStatusCodes,
    /// AUTH mechanisms offered; only advertised once TLS is active.
    Auth(Vec<crate::command::AuthMechanism>),
    Etrn,
}

impl Display for Extension {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starttls(_) => f.write_str("STARTTLS"),
            Self::Help => f.write_str("HELP"),
            Self::Size(max) => write!(f, "SIZE {max}"),
            Self::Pipelining => f.write_str("PIPELINING"),
            Self::EightBitMime => f.write_str("8BITMIME"),
            Self::Smtputf8 => f.write_str("SMTPUTF8"),
            Self::Chunking => f.write_str("CHUNKING"),
            Self::Binarymime => f.write_str("BINARYMIME"),
            Self::Dsn => f.write_str("DSN"),
            Self::EnhancedStatusCodes => f.write_str("ENHANCEDSTATUSCODES"),
            Self::Auth(mechanisms) => {
                write!(f, "AUTH")?;
                for mechanism in mechanisms {
                    write!(f, " {mechanism}")?;
                }
                Ok(())
            }
            Self::Etrn => f.write_str("ETRN"),
        }
    }
}

/// Builds the fixed set of extensions every listener advertises, plus the
/// conditional ones (STARTTLS, AUTH, ETRN) depending on current session
/// state and listener configuration.
#[must_use]
pub fn always_advertised(max_message_size: usize) -> Vec<Extension> {
    vec![
        Extension::Pipelining,
        Extension::EightBitMime,
        Extension::Smtputf8,
        Extension::Chunking,
        Extension::Binarymime,
        Extension::Dsn,
        Extension::Size(max_message_size),
        Extension::EnhancedStatusCodes,
    ]
}

#[cfg(test)]
mod tests {
    use super::Extension;

    #[test]
    fn size_renders_with_max() {
        assert_eq!(Extension::Size(1000).to_string(), "SIZE 1000");
    }

    #[test]
    fn auth_renders_mechanisms() {
        use crate::command::AuthMechanism;
        let ext = Extension::Auth(vec![AuthMechanism::Plain, AuthMechanism::Login]);
        assert_eq!(ext.to_string(), "AUTH PLAIN LOGIN");
    }

    #[test]
    fn always_advertised_includes_fixed_set() {
        let exts = super::always_advertised(100);
        assert!(exts.contains(&Extension::Pipelining));
        assert!(exts.contains(&Extension::Chunking));
        assert!(exts.contains(&Extension::Size(100)));
    }
}

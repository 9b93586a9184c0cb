//! Parsed SMTP command line, per RFC 5321 (verbs) and RFC 3461/1870/6152
//! (ESMTP parameters).

use core::fmt::{self, Display, Formatter};

use embermail_common::{
    address::{Address, AddressList},
    envelope::{BodyType, DsnReturn, MailParameters, NotifyFlags},
};

/// Distinguishes EHLO (extended) from HELO (basic) greetings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

/// The AUTH mechanism named on an AUTH command (RFC 4954).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
}

impl Display for AuthMechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        })
    }
}

/// A parsed SMTP command line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Helo(HeloVariant),
    Help,
    MailFrom {
        sender: Option<Address>,
        params: MailParameters,
    },
    RcptTo {
        recipients: Vec<(Address, NotifyFlags, Option<String>)>,
    },
    Rset,
    Auth {
        mechanism: AuthMechanism,
        initial_response: Option<String>,
    },
    Data,
    Bdat {
        size: usize,
        last: bool,
    },
    Vrfy(String),
    Expn(String),
    Etrn(String),
    Noop,
    Quit,
    StartTLS,
    Invalid(String),
}

impl Command {
    /// The raw text echoed back into a session's transcript on parse failure.
    #[must_use]
    pub fn inner(&self) -> String {
        match self {
            Self::Invalid(reason) => reason.clone(),
            other => format!("{other}"),
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(HeloVariant::Ehlo(id)) => write!(f, "EHLO {id}"),
            Self::Helo(HeloVariant::Helo(id)) => write!(f, "HELO {id}"),
            Self::Help => f.write_str("HELP"),
            Self::MailFrom { .. } => f.write_str("MAIL FROM"),
            Self::RcptTo { .. } => f.write_str("RCPT TO"),
            Self::Rset => f.write_str("RSET"),
            Self::Auth { mechanism, .. } => write!(f, "AUTH {mechanism}"),
            Self::Data => f.write_str("DATA"),
            Self::Bdat { size, last } => write!(f, "BDAT {size}{}", if *last { " LAST" } else { "" }),
            Self::Vrfy(arg) => write!(f, "VRFY {arg}"),
            Self::Expn(arg) => write!(f, "EXPN {arg}"),
            Self::Etrn(arg) => write!(f, "ETRN {arg}"),
            Self::Noop => f.write_str("NOOP"),
            Self::Quit => f.write_str("QUIT"),
            Self::StartTLS => f.write_str("STARTTLS"),
            Self::Invalid(reason) => write!(f, "Invalid command: {reason}"),
        }
    }
}

/// A command could not be parsed from the client's line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandParseError {
    #[error("unrecognised verb {0:?}")]
    UnknownVerb(String),
    #[error("missing argument for {0}")]
    MissingArgument(&'static str),
    #[error("malformed address: {0}")]
    Address(String),
    #[error("duplicate parameter {0}")]
    DuplicateParameter(String),
    #[error("unrecognised parameter {0}")]
    UnrecognisedParameter(String),
    #[error("malformed parameter {0}")]
    MalformedParameter(String),
    #[error("not valid UTF-8")]
    NotUtf8,
}

fn split_verb(line: &str) -> (&str, &str) {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    match trimmed.find(|c: char| c.is_ascii_whitespace()) {
        Some(idx) => (&trimmed[..idx], trimmed[idx..].trim_start()),
        None => (trimmed, ""),
    }
}

fn parse_address(raw: &str) -> Result<Option<Address>, CommandParseError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("<>") || raw.is_empty() {
        return Ok(None);
    }

    let mailbox = embermail_common::address_parser::parse_forward_path(raw)
        .map_err(|e| CommandParseError::Address(format!("{e:?}")))?;

    let parsed = mailparse::addrparse(&mailbox.to_string())
        .map_err(|e| CommandParseError::Address(e.to_string()))?;
    let mut list = AddressList::from(parsed);
    list.0
        .pop()
        .map(Some)
        .ok_or_else(|| CommandParseError::Address(raw.to_string()))
}

/// Splits `MAIL FROM:<addr> PARAM=VALUE ...` into the path token and the
/// trailing parameter string.
fn split_path_and_params(args: &str) -> (&str, &str) {
    let args = args.trim_start();
    if let Some(rest) = args.strip_prefix('<') {
        if let Some(end) = rest.find('>') {
            return (&args[..=end], args[end + 2..].trim_start());
        }
    }
    match args.find(char::is_whitespace) {
        Some(idx) => (&args[..idx], args[idx..].trim_start()),
        None => (args, ""),
    }
}

fn parse_mail_params(raw: &str) -> Result<MailParameters, CommandParseError> {
    let mut params = MailParameters::default();
    let mut seen_size = false;
    let mut seen_body = false;
    let mut seen_smtputf8 = false;
    let mut seen_ret = false;
    let mut seen_envid = false;

    for token in raw.split_ascii_whitespace() {
        let (key, value) = token.split_once('=').unwrap_or((token, ""));
        match key.to_ascii_uppercase().as_str() {
            "SIZE" => {
                if seen_size {
                    return Err(CommandParseError::DuplicateParameter("SIZE".into()));
                }
                seen_size = true;
                params.size = Some(
                    value
                        .parse()
                        .map_err(|_| CommandParseError::MalformedParameter("SIZE".into()))?,
                );
            }
            "BODY" => {
                if seen_body {
                    return Err(CommandParseError::DuplicateParameter("BODY".into()));
                }
                seen_body = true;
                params.body = match value.to_ascii_uppercase().as_str() {
                    "7BIT" => BodyType::SevenBit,
                    "8BITMIME" => BodyType::EightBitMime,
                    "BINARYMIME" => BodyType::Binarymime,
                    _ => return Err(CommandParseError::MalformedParameter("BODY".into())),
                };
            }
            "SMTPUTF8" => {
                if seen_smtputf8 {
                    return Err(CommandParseError::DuplicateParameter("SMTPUTF8".into()));
                }
                seen_smtputf8 = true;
                params.smtputf8 = true;
            }
            "RET" => {
                if seen_ret {
                    return Err(CommandParseError::DuplicateParameter("RET".into()));
                }
                seen_ret = true;
                params.ret = Some(match value.to_ascii_uppercase().as_str() {
                    "FULL" => DsnReturn::Full,
                    "HDRS" => DsnReturn::Headers,
                    _ => return Err(CommandParseError::MalformedParameter("RET".into())),
                });
            }
            "ENVID" => {
                if seen_envid {
                    return Err(CommandParseError::DuplicateParameter("ENVID".into()));
                }
                seen_envid = true;
                if value.is_empty() || value.len() > 100 || value.contains(char::is_whitespace) {
                    return Err(CommandParseError::MalformedParameter("ENVID".into()));
                }
                params.envid = Some(value.to_string());
            }
            other => return Err(CommandParseError::UnrecognisedParameter(other.to_string())),
        }
    }

    Ok(params)
}

fn parse_rcpt_params(
    raw: &str,
) -> Result<(NotifyFlags, Option<String>), CommandParseError> {
    let mut notify = NotifyFlags::default_on_failure();
    let mut orcpt = None;
    let mut seen_notify = false;
    let mut seen_orcpt = false;

    for token in raw.split_ascii_whitespace() {
        let (key, value) = token.split_once('=').unwrap_or((token, ""));
        match key.to_ascii_uppercase().as_str() {
            "NOTIFY" => {
                if seen_notify {
                    return Err(CommandParseError::DuplicateParameter("NOTIFY".into()));
                }
                seen_notify = true;
                notify = NotifyFlags::default();
                for flag in value.split(',') {
                    match flag.to_ascii_uppercase().as_str() {
                        "NEVER" => notify.never = true,
                        "SUCCESS" => notify.success = true,
                        "FAILURE" => notify.failure = true,
                        "DELAY" => notify.delay = true,
                        _ => return Err(CommandParseError::MalformedParameter("NOTIFY".into())),
                    }
                }
                if notify.never && (notify.success || notify.failure || notify.delay) {
                    return Err(CommandParseError::MalformedParameter("NOTIFY".into()));
                }
            }
            "ORCPT" => {
                if seen_orcpt {
                    return Err(CommandParseError::DuplicateParameter("ORCPT".into()));
                }
                seen_orcpt = true;
                if !value.starts_with("rfc822;") {
                    return Err(CommandParseError::MalformedParameter("ORCPT".into()));
                }
                orcpt = Some(value.to_string());
            }
            other => return Err(CommandParseError::UnrecognisedParameter(other.to_string())),
        }
    }

    Ok((notify, orcpt))
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let (verb, args) = split_verb(line);
        let upper = verb.to_ascii_uppercase();

        let parsed = match upper.as_str() {
            "EHLO" if !args.is_empty() => Ok(Self::Helo(HeloVariant::Ehlo(args.to_string()))),
            "HELO" if !args.is_empty() => Ok(Self::Helo(HeloVariant::Helo(args.to_string()))),
            "HELP" => Ok(Self::Help),
            "NOOP" => Ok(Self::Noop),
            "RSET" => Ok(Self::Rset),
            "DATA" => Ok(Self::Data),
            "QUIT" => Ok(Self::Quit),
            "STARTTLS" => Ok(Self::StartTLS),
            "VRFY" if !args.is_empty() => Ok(Self::Vrfy(args.to_string())),
            "EXPN" if !args.is_empty() => Ok(Self::Expn(args.to_string())),
            "ETRN" if !args.is_empty() => Ok(Self::Etrn(args.to_string())),
            "MAIL" => {
                let rest = args.strip_prefix("FROM:").or_else(|| {
                    args.split_once(':')
                        .filter(|(k, _)| k.eq_ignore_ascii_case("from"))
                        .map(|(_, v)| v)
                });
                match rest {
                    Some(rest) => {
                        let (path, params_raw) = split_path_and_params(rest);
                        let sender = parse_address(path).map_err(|e| {
                            Self::Invalid(format!("malformed MAIL FROM: {e}"))
                        })?;
                        let params = parse_mail_params(params_raw)
                            .map_err(|e| Self::Invalid(format!("bad MAIL parameter: {e}")))?;
                        Ok(Self::MailFrom { sender, params })
                    }
                    None => Err(Self::Invalid("MAIL requires FROM:<path>".to_string())),
                }
            }
            "RCPT" => {
                let rest = args.strip_prefix("TO:").or_else(|| {
                    args.split_once(':')
                        .filter(|(k, _)| k.eq_ignore_ascii_case("to"))
                        .map(|(_, v)| v)
                });
                match rest {
                    Some(rest) => {
                        let (path, params_raw) = split_path_and_params(rest);
                        let address = parse_address(path)
                            .map_err(|e| Self::Invalid(format!("malformed RCPT TO: {e}")))?
                            .ok_or_else(|| {
                                Self::Invalid("RCPT TO requires a non-null path".to_string())
                            })?;
                        let (notify, orcpt) = parse_rcpt_params(params_raw)
                            .map_err(|e| Self::Invalid(format!("bad RCPT parameter: {e}")))?;
                        Ok(Self::RcptTo {
                            recipients: vec![(address, notify, orcpt)],
                        })
                    }
                    None => Err(Self::Invalid("RCPT requires TO:<path>".to_string())),
                }
            }
            "BDAT" => {
                let mut parts = args.split_ascii_whitespace();
                let size = parts
                    .next()
                    .and_then(|s| s.parse::<usize>().ok())
                    .ok_or_else(|| Self::Invalid("BDAT requires a chunk size".to_string()))?;
                let last = matches!(parts.next(), Some(tok) if tok.eq_ignore_ascii_case("LAST"));
                Ok(Self::Bdat { size, last })
            }
            "AUTH" => {
                let mut parts = args.splitn(2, char::is_whitespace);
                let mechanism = match parts.next().map(str::to_ascii_uppercase).as_deref() {
                    Some("PLAIN") => AuthMechanism::Plain,
                    Some("LOGIN") => AuthMechanism::Login,
                    Some(other) => {
                        return Err(Self::Invalid(format!("unsupported AUTH mechanism {other}")));
                    }
                    None => return Err(Self::Invalid("AUTH requires a mechanism".to_string())),
                };
                let initial_response = parts.next().map(str::trim).filter(|s| !s.is_empty());
                Ok(Self::Auth {
                    mechanism,
                    initial_response: initial_response.map(str::to_string),
                })
            }
            "" => Err(Self::Invalid("empty command".to_string())),
            other => Err(Self::Invalid(format!("unrecognised command {other}"))),
        };

        match parsed {
            Ok(command) => Ok(command),
            Err(invalid) => Ok(invalid),
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        match std::str::from_utf8(value) {
            Ok(line) => Self::try_from(line),
            Err(_) => Ok(Self::Invalid("command line is not valid UTF-8".to_string())),
        }
    }
}

impl TryFrom<String> for Command {
    type Error = Self;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn string_casing(s: &str) -> Vec<String> {
        vec![s.to_ascii_lowercase(), s.to_ascii_uppercase(), s.to_string()]
    }

    #[test]
    fn parses_ehlo_and_helo() {
        for variant in string_casing("EHLO") {
            let cmd = Command::try_from(format!("{variant} client.example.com").as_str()).unwrap();
            assert!(matches!(cmd, Command::Helo(HeloVariant::Ehlo(id)) if id == "client.example.com"));
        }
        for variant in string_casing("HELO") {
            let cmd = Command::try_from(format!("{variant} client.example.com").as_str()).unwrap();
            assert!(matches!(cmd, Command::Helo(HeloVariant::Helo(id)) if id == "client.example.com"));
        }
    }

    #[test]
    fn parses_mail_from_with_size_and_body() {
        let cmd =
            Command::try_from("MAIL FROM:<a@example.com> SIZE=1024 BODY=8BITMIME").unwrap();
        match cmd {
            Command::MailFrom { sender, params } => {
                assert!(sender.is_some());
                assert_eq!(params.size, Some(1024));
                assert_eq!(params.body, BodyType::EightBitMime);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_size_param() {
        let cmd = Command::try_from("MAIL FROM:<a@example.com> SIZE=1 SIZE=2").unwrap();
        assert!(matches!(cmd, Command::Invalid(_)));
    }

    #[test]
    fn null_reverse_path_is_none() {
        let cmd = Command::try_from("MAIL FROM:<>").unwrap();
        match cmd {
            Command::MailFrom { sender, .. } => assert!(sender.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_rcpt_to_with_notify_and_orcpt() {
        let cmd =
            Command::try_from("RCPT TO:<b@example.com> NOTIFY=SUCCESS,FAILURE ORCPT=rfc822;b@example.com")
                .unwrap();
        match cmd {
            Command::RcptTo { recipients } => {
                assert_eq!(recipients.len(), 1);
                let (_, notify, orcpt) = &recipients[0];
                assert!(notify.wants_success());
                assert!(notify.wants_failure());
                assert_eq!(orcpt.as_deref(), Some("rfc822;b@example.com"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_bdat_with_last() {
        let cmd = Command::try_from("BDAT 1024 LAST").unwrap();
        assert_eq!(cmd, Command::Bdat { size: 1024, last: true });
    }

    #[test]
    fn parses_bdat_without_last() {
        let cmd = Command::try_from("BDAT 512").unwrap();
        assert_eq!(cmd, Command::Bdat { size: 512, last: false });
    }

    #[test]
    fn parses_auth_plain_with_initial_response() {
        let cmd = Command::try_from("AUTH PLAIN AGEAcGFzcw==").unwrap();
        match cmd {
            Command::Auth { mechanism, initial_response } => {
                assert_eq!(mechanism, AuthMechanism::Plain);
                assert_eq!(initial_response.as_deref(), Some("AGEAcGFzcw=="));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_auth_login_without_initial_response() {
        let cmd = Command::try_from("AUTH LOGIN").unwrap();
        assert_eq!(
            cmd,
            Command::Auth {
                mechanism: AuthMechanism::Login,
                initial_response: None
            }
        );
    }

    #[test]
    fn unknown_verb_is_invalid() {
        let cmd = Command::try_from("FROBNICATE foo").unwrap();
        assert!(matches!(cmd, Command::Invalid(_)));
    }

    #[test]
    fn simple_verbs_parse_regardless_of_case() {
        for variant in string_casing("QUIT") {
            assert_eq!(Command::try_from(variant.as_str()).unwrap(), Command::Quit);
        }
        for variant in string_casing("NOOP") {
            assert_eq!(Command::try_from(variant.as_str()).unwrap(), Command::Noop);
        }
    }
}

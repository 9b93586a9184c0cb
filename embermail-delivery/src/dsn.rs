//! Delivery Status Notification synthesis: given an original submission and
//! a set of permanently-failed recipients, build an RFC 3464
//! `multipart/report` bounce message and hand back a fresh
//! [`SpoolSubmission`] ready to be re-enqueued with the null reverse-path.

use std::path::PathBuf;

use chrono::Utc;
use embermail_common::envelope::RecipientEntry;
use embermail_spool::entry::{RecipientDisposition, SpoolEntry, SpoolSubmission};
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, SystemError};

/// Where a permanent-failure reason string originated, which decides the
/// `Diagnostic-Code` type token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// The reason is a verbatim remote SMTP response.
    Smtp,
    /// The reason was produced internally (policy rejection, rate limiting
    /// that exhausted retries, routing failure, ...).
    Internal,
}

/// One recipient's terminal failure, as reported by the delivery service.
#[derive(Debug, Clone)]
pub struct RecipientFailure {
    pub recipient: String,
    pub reason: String,
    pub diagnostic: DiagnosticKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsnConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    /// Hostname reported as `Reporting-MTA` and used in `X-Loop`/`Message-ID`.
    #[serde(default = "defaults::reporting_mta")]
    pub reporting_mta: String,
    /// Local part of the `From:` address on generated DSNs.
    #[serde(default = "defaults::postmaster")]
    pub postmaster: String,
    /// Cap, in bytes, on how much of the original message is attached in
    /// full when RET=FULL was requested. Beyond this the headers-only
    /// extract is used instead.
    #[serde(default = "defaults::max_original_bytes")]
    pub max_original_bytes: usize,
}

impl Default for DsnConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            reporting_mta: defaults::reporting_mta(),
            postmaster: defaults::postmaster(),
            max_original_bytes: defaults::max_original_bytes(),
        }
    }
}

mod defaults {
    pub const fn enabled() -> bool {
        true
    }

    pub fn reporting_mta() -> String {
        "localhost".to_string()
    }

    pub fn postmaster() -> String {
        "MAILER-DAEMON".to_string()
    }

    pub const fn max_original_bytes() -> usize {
        1024 * 1024
    }
}

/// Whether a DSN should be produced at all for this entry: requires a
/// non-null reverse-path and at least one permanent failure.
#[must_use]
pub fn should_generate(sender: Option<&str>, failures: &[RecipientFailure]) -> bool {
    sender.is_some_and(|s| !s.is_empty()) && !failures.is_empty()
}

/// Loop-prevention: suppress generating a DSN for a message that is itself
/// an automated report, to avoid bounce storms.
#[must_use]
pub fn should_suppress(original_headers: &str, reporting_mta: &str) -> bool {
    let parsed = mailparse::parse_headers(original_headers.as_bytes()).ok();
    let Some((headers, _)) = parsed else {
        return false;
    };

    for header in &headers {
        let key = header.get_key_ref().to_ascii_lowercase();
        let value = header.get_value();

        match key.as_str() {
            "auto-submitted" => {
                if !value.trim().eq_ignore_ascii_case("no") {
                    return true;
                }
            }
            "x-loop" => {
                if value.trim().eq_ignore_ascii_case(reporting_mta) {
                    return true;
                }
            }
            "precedence" => {
                let value = value.trim().to_ascii_lowercase();
                if value == "bulk" || value == "junk" || value == "list" {
                    return true;
                }
            }
            "content-type" => {
                let value = value.to_ascii_lowercase();
                if value.starts_with("message/delivery-status")
                    || (value.starts_with("multipart/report")
                        && value.contains("report-type=delivery-status"))
                {
                    return true;
                }
            }
            _ => {}
        }
    }

    false
}

/// Maps a permanent-failure reason to an RFC 3463 enhanced status code.
///
/// Resolution order: an enhanced code already embedded in the reason text,
/// then the leading SMTP three-digit code, then a handful of textual
/// heuristics, defaulting to `5.0.0`.
#[must_use]
pub fn map_reason_to_enhanced_status(reason: &str) -> embermail_common::status::EnhancedStatusCode {
    use embermail_common::status::EnhancedStatusCode as Code;

    if let Some(code) = extract_embedded_enhanced_code(reason) {
        return code;
    }

    if let Some(code) = extract_leading_smtp_code(reason) {
        return smtp_code_to_enhanced(code);
    }

    let lowered = reason.to_ascii_lowercase();
    if lowered.contains("user unknown") || lowered.contains("no such user") {
        return Code::BAD_MAILBOX;
    }
    if lowered.contains("mailbox full") || lowered.contains("quota") || lowered.contains("over quota") {
        return Code::new(5, 2, 2);
    }
    if lowered.contains("null mx") {
        return Code::new(5, 1, 10);
    }

    Code::new(5, 0, 0)
}

fn extract_embedded_enhanced_code(reason: &str) -> Option<embermail_common::status::EnhancedStatusCode> {
    for word in reason.split(|c: char| c.is_whitespace()) {
        let trimmed = word.trim_matches(|c: char| !c.is_ascii_digit() && c != '.');
        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() == 3 {
            let class: u8 = parts[0].parse().ok()?;
            let subject: u16 = parts[1].parse().ok()?;
            let detail: u16 = parts[2].parse().ok()?;
            if (2..=5).contains(&class) {
                return Some(embermail_common::status::EnhancedStatusCode::new(class, subject, detail));
            }
        }
    }
    None
}

fn extract_leading_smtp_code(reason: &str) -> Option<u32> {
    let digits: String = reason.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() == 3 {
        digits.parse().ok()
    } else {
        None
    }
}

fn smtp_code_to_enhanced(code: u32) -> embermail_common::status::EnhancedStatusCode {
    use embermail_common::status::EnhancedStatusCode as Code;
    match code {
        550 => Code::BAD_MAILBOX,
        552 => Code::new(5, 2, 2),
        553 => Code::BAD_MAILBOX_SYNTAX,
        554 => Code::new(5, 0, 0),
        400..=499 => Code::new(4, 0, 0),
        _ => Code::new(5, 0, 0),
    }
}

/// Builds the DSN message body and returns a [`SpoolSubmission`] ready for
/// re-enqueueing with the null reverse-path.
///
/// # Errors
/// Returns an error if the original message cannot be read, or if the DSN
/// body cannot be written to a temporary file.
pub async fn generate(
    entry: &SpoolEntry,
    failures: &[RecipientFailure],
    config: &DsnConfig,
) -> Result<Option<SpoolSubmission>, DeliveryError> {
    let Some(sender) = entry.sender.as_deref().filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    if failures.is_empty() {
        return Ok(None);
    }

    let original = tokio::fs::read(&entry.message_path)
        .await
        .map_err(SystemError::Io)?;
    let header_end = find_header_end(&original);
    let original_headers = String::from_utf8_lossy(&original[..header_end]);

    if should_suppress(&original_headers, &config.reporting_mta) {
        return Ok(None);
    }

    let body = build_report_body(entry, sender, failures, &original, header_end, config);

    let dir = std::env::temp_dir();
    let filename = format!("dsn-{}.eml", ulid::Ulid::new());
    let path: PathBuf = dir.join(filename);
    tokio::fs::write(&path, &body).await.map_err(SystemError::Io)?;

    let mut parsed = mailparse::addrparse(sender)
        .map_err(|e| DeliveryError::System(SystemError::Internal(format!("cannot parse DSN recipient: {e}"))))?;
    if parsed.is_empty() {
        return Err(DeliveryError::System(SystemError::Internal(
            "DSN recipient address did not parse to any mailbox".to_string(),
        )));
    }
    let mail_addr = parsed.remove(0);

    let recipient = RecipientDisposition {
        entry: RecipientEntry {
            address: embermail_common::address::Address::from(mail_addr),
            notify: embermail_common::envelope::NotifyFlags::default_on_failure(),
            orcpt: None,
        },
        local: false,
    };

    Ok(Some(SpoolSubmission {
        sender: None,
        recipients: vec![recipient],
        message_path: path,
        message_len: body.len(),
        client_id: config.reporting_mta.clone(),
        authenticated_as: None,
        ret: None,
        envid: None,
        received_at_unix: embermail_spool::entry::now_unix(),
    }))
}

fn find_header_end(raw: &[u8]) -> usize {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map_or(raw.len(), |pos| pos + 4)
}

fn build_report_body(
    entry: &SpoolEntry,
    sender: &str,
    failures: &[RecipientFailure],
    original: &[u8],
    header_end: usize,
    config: &DsnConfig,
) -> Vec<u8> {
    let boundary = format!("dsn-boundary-{}", ulid::Ulid::new());
    let date = Utc::now().to_rfc2822();
    let message_id = format!("<{}@{}>", ulid::Ulid::new(), config.reporting_mta);

    let mut out = String::new();
    out.push_str(&format!("From: {}@{}\r\n", config.postmaster, config.reporting_mta));
    out.push_str(&format!("To: {sender}\r\n"));
    out.push_str("Subject: Undelivered Mail Returned to Sender\r\n");
    out.push_str(&format!("Date: {date}\r\n"));
    out.push_str(&format!("Message-ID: {message_id}\r\n"));
    out.push_str("Auto-Submitted: auto-replied\r\n");
    out.push_str(&format!("X-Loop: {}\r\n", config.reporting_mta));
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str(&format!(
        "Content-Type: multipart/report; report-type=delivery-status; boundary=\"{boundary}\"\r\n"
    ));
    out.push_str("\r\n");

    out.push_str(&format!("--{boundary}\r\n"));
    out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
    out.push_str("This is an automatically generated Delivery Status Notification.\r\n\r\n");
    out.push_str("Delivery to the following recipient(s) failed permanently:\r\n\r\n");
    for failure in failures {
        out.push_str(&format!("  {} -- {}\r\n", failure.recipient, failure.reason));
    }
    out.push_str("\r\n");

    out.push_str(&format!("--{boundary}\r\n"));
    out.push_str("Content-Type: message/delivery-status\r\n\r\n");
    out.push_str(&format!("Reporting-MTA: dns; {}\r\n", config.reporting_mta));
    let arrival = chrono::DateTime::from_timestamp(entry.received_at_unix, 0)
        .unwrap_or_default()
        .to_rfc2822();
    out.push_str(&format!("Arrival-Date: {arrival}\r\n"));
    out.push_str("\r\n");
    for failure in failures {
        let code = map_reason_to_enhanced_status(&failure.reason);
        let diagnostic_kind = match failure.diagnostic {
            DiagnosticKind::Smtp => "smtp",
            DiagnosticKind::Internal => "x-internal",
        };
        out.push_str(&format!("Final-Recipient: rfc822; {}\r\n", failure.recipient));
        out.push_str("Action: failed\r\n");
        out.push_str(&format!("Status: {code}\r\n"));
        out.push_str(&format!("Diagnostic-Code: {diagnostic_kind}; {}\r\n", failure.reason));
        out.push_str("\r\n");
    }

    out.push_str(&format!("--{boundary}\r\n"));
    let want_full = matches!(entry.ret, Some(embermail_common::envelope::DsnReturn::Full));
    if want_full && original.len() <= config.max_original_bytes {
        out.push_str("Content-Type: message/rfc822\r\n\r\n");
        out.push_str(&String::from_utf8_lossy(original));
    } else {
        out.push_str("Content-Type: text/rfc822-headers\r\n\r\n");
        out.push_str(&String::from_utf8_lossy(&original[..header_end]));
    }
    out.push_str(&format!("\r\n--{boundary}--\r\n"));

    out.into_bytes()
}

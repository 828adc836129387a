//! Signing eligibility decisions for outgoing messages.
//!
//! A message is only signed when its `From` header names the same mailbox
//! as the envelope sender and that mailbox is on the configured allow-list.
//! Everything here is pure, the decision depends only on the arguments.

use std::{fmt::Display, path::PathBuf};

use crate::{extract_address, normalize_address};

/// Reason for letting a message through the pipeline unsigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The message carries no (or an empty) `From` header.
    MissingHeader,
    /// The `From` header address differs from the envelope sender.
    SenderMismatch { header: String, envelope: String },
    /// The envelope sender is not on the allow-list.
    NotAllowed { sender: String },
    /// No credential bundle is provisioned for the sender.
    CredentialNotFound { sender: String, path: PathBuf },
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingHeader => write!(f, "Missing From header"),
            SkipReason::SenderMismatch { header, envelope } => {
                write!(f, "Header-From ({header}) differs from Envelope-From ({envelope})")
            }
            SkipReason::NotAllowed { sender } => {
                write!(f, "Envelope-From ({sender}) not in allowed emails")
            }
            SkipReason::CredentialNotFound { sender, path } => {
                write!(f, "No certificate found at {} for {sender}", path.display())
            }
        }
    }
}

/// Outcome of the eligibility evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    /// The message may be signed on behalf of the (normalized) sender.
    Eligible(String),
    /// The message must pass through unsigned.
    Skip(SkipReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible(_))
    }
}

/// Decides whether a message may be signed.
///
/// `header_from` is the raw `From` header value as found in the message,
/// the address is taken from its first `<...>` group or from the whole
/// value. Both addresses and the allow-list entries are compared
/// case-insensitively. An empty allow-list skips every message.
pub fn evaluate<S: AsRef<str>>(
    envelope_from: &str,
    header_from: Option<&str>,
    allowed: &[S],
) -> Eligibility {
    let header_from = match header_from.map(str::trim) {
        Some(value) if !value.is_empty() => value,
        _ => return Eligibility::Skip(SkipReason::MissingHeader),
    };

    let envelope = normalize_address(envelope_from);
    let header = normalize_address(extract_address(header_from));
    if header != envelope {
        return Eligibility::Skip(SkipReason::SenderMismatch { header, envelope });
    }

    let allowed: Vec<String> = allowed
        .iter()
        .map(|address| normalize_address(address.as_ref()))
        .collect();
    if !allowed.contains(&envelope) {
        return Eligibility::Skip(SkipReason::NotAllowed { sender: envelope });
    }

    Eligibility::Eligible(envelope)
}

/// Immutable signing policy, built once from configuration and handed to
/// every evaluation.
#[derive(Debug, Clone, Default)]
pub struct SigningPolicy {
    allowed: Vec<String>,
}

impl SigningPolicy {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the allow-list as configured (case preserved).
    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    /// Evaluates a message against this policy, see [`evaluate`].
    pub fn evaluate(&self, envelope_from: &str, header_from: Option<&str>) -> Eligibility {
        evaluate(envelope_from, header_from, &self.allowed)
    }
}

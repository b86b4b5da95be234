use std::net::IpAddr;
use thiserror::Error;

/// Reasons a whole datagram is rejected by the decoder.
///
/// Per-field problems never surface here; they are skipped while decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short: {len} bytes")]
    PayloadTooShort { len: usize },

    #[error("unsupported flow export version {0}")]
    UnsupportedVersion(u16),

    #[error(
        "template {template_id} not found for exporter {exporter} (version {version}, domain {domain})"
    )]
    TemplateNotFound {
        exporter: IpAddr,
        version: u16,
        domain: u32,
        template_id: u16,
    },

    #[error("truncated {what}")]
    Truncated { what: &'static str },

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },
}

impl DecodeError {
    /// Data arrived before (or long after) its template. Expected over UDP.
    pub fn is_template_error(&self) -> bool {
        matches!(self, Self::TemplateNotFound { .. })
    }

    pub(crate) fn truncated(what: &'static str) -> Self {
        Self::Truncated { what }
    }

    pub(crate) fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            detail: detail.into(),
        }
    }
}

//! Typed, recoverable decoder/output faults.
//!
//! These travel between threads (decoder -> player -> controller) as plain
//! data, unlike the `color_eyre::Report`s used for operator-facing
//! diagnostics elsewhere in the crate. Keeping the two separate mirrors the
//! split in the original `struct decoder_error` / logged diagnostics: a
//! stream hiccup is not the same kind of thing as "config file missing".

use std::fmt;

/// Mirrors `enum decoder_error_type`: `STREAM` is recoverable (skip a frame
/// and keep going), `FATAL` aborts the current item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderErrorKind {
    Ok,
    Stream,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderError {
    pub kind: DecoderErrorKind,
    pub message: Option<String>,
}

impl DecoderError {
    pub const OK: DecoderError = DecoderError {
        kind: DecoderErrorKind::Ok,
        message: None,
    };

    pub fn stream(message: impl Into<String>) -> Self {
        Self {
            kind: DecoderErrorKind::Stream,
            message: Some(message.into()),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: DecoderErrorKind::Fatal,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.kind == DecoderErrorKind::Ok
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == DecoderErrorKind::Fatal
    }
}

impl Default for DecoderError {
    fn default() -> Self {
        Self::OK
    }
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.message) {
            (DecoderErrorKind::Ok, _) => write!(f, "ok"),
            (_, Some(m)) => write!(f, "{m}"),
            (DecoderErrorKind::Stream, None) => write!(f, "stream error"),
            (DecoderErrorKind::Fatal, None) => write!(f, "fatal decoder error"),
        }
    }
}

impl std::error::Error for DecoderError {}

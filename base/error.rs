// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Error type and kind taxonomy shared across the crate.
//!
//! Every fallible operation returns [`Error`], which pairs a [`ErrorKind`]
//! label with an optional message and source. The `err!`/`bail!` macros are
//! the normal way to construct one; they read like `failure`'s `format_err!`/
//! `bail!` but tag the result with a kind from the start, so callers can
//! match on `e.kind()` instead of parsing strings.

use std::fmt;
use std::sync::Arc;

/// Error kind. The first block is a gRPC-style general-purpose taxonomy;
/// the second is specific to the NVR's stream pipeline (see the design
/// document's error propagation policy).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,

    // Stream pipeline specific kinds (see design doc's error taxonomy).
    ConfigInvalid,
    Unreachable,
    Unauthorized,
    NoVideoStream,
    WriterIOError,
    TimestampDiscontinuity,
    DecoderMismatch,
    DetectionStuck,
    DetectionModelLoadError,
    ShutdownRequested,
    /// Violated invariant; always a bug, never a caller error.
    Bug,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
            ErrorKind::ConfigInvalid => "Invalid configuration",
            ErrorKind::Unreachable => "Stream unreachable",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::NoVideoStream => "No video stream offered",
            ErrorKind::WriterIOError => "Writer I/O error",
            ErrorKind::TimestampDiscontinuity => "Timestamp discontinuity",
            ErrorKind::DecoderMismatch => "Decoder parameter mismatch",
            ErrorKind::DetectionStuck => "Detection stuck",
            ErrorKind::DetectionModelLoadError => "Detection model load error",
            ErrorKind::ShutdownRequested => "Shutdown requested",
            ErrorKind::Bug => "Bug",
        };
        f.write_str(s)
    }
}

struct Inner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// The crate's error type: a kind, an optional human-readable message, and an
/// optional chained source.
pub struct Error(Box<Inner>);

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error(Box::new(Inner {
            kind,
            msg: None,
            source: None,
        }))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    #[must_use]
    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.0.msg = Some(msg.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.0.source = Some(Box::new(source));
        self
    }

    /// Returns a value whose `Display` impl walks the whole source chain,
    /// one cause per line, the way `failure::Fail::iter_causes` did.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cause = self
            .0
             .0
            .source
            .as_deref()
            .map(|s| s as &dyn std::error::Error);
        while let Some(c) = cause {
            write!(f, "\ncaused by: {c}")?;
            cause = c.source();
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.0.msg {
            None => write!(f, "{}", self.0.kind),
            Some(m) => write!(f, "{}: {}", self.0.kind, m),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.chain())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source.as_deref().map(|s| s as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::TimedOut => ErrorKind::DeadlineExceeded,
            _ => ErrorKind::Unknown,
        };
        Error::new(kind).with_source(e)
    }
}

/// `Arc<Error>` is handy for `last_error` slots shared across threads without
/// an extra mutex for the error path alone; `Error` itself stays `!Clone` so
/// construction sites don't pay for reference counting they don't need.
pub type SharedError = Arc<Error>;

/// Extension methods for `Result`, for annotating foreign errors with a kind.
pub trait ResultExt<T> {
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k).with_source(e))
    }
}

/// Builds an [`Error`] with a kind and optional `msg(...)`/`source(...)` clauses.
///
/// ```ignore
/// err!(Unknown, msg("couldn't find supported video stream"))
/// err!(DeadlineExceeded, msg("timed out after {timeout:?}"), source(e))
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind)
    };
    ($kind:ident, msg($($arg:tt)+)) => {
        $crate::Error::new($crate::ErrorKind::$kind).with_msg(format!($($arg)+))
    };
    ($kind:ident, source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind).with_source($src)
    };
    ($kind:ident, msg($($arg:tt)+), source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind)
            .with_msg(format!($($arg)+))
            .with_source($src)
    };
}

/// Like [`err!`] but returns early with `Err(..)`.
#[macro_export]
macro_rules! bail {
    ($($args:tt)+) => {
        return Err($crate::err!($($args)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_msg_and_kind() {
        let e = err!(NoVideoStream, msg("stream {} has no video", "cam0"));
        assert_eq!(e.kind(), ErrorKind::NoVideoStream);
        assert_eq!(
            e.to_string(),
            "No video stream offered: stream cam0 has no video"
        );
    }

    #[test]
    fn chain_walks_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e = err!(WriterIOError, msg("flushing segment"), source(io));
        let chain = e.chain().to_string();
        assert!(chain.contains("Writer I/O error: flushing segment"));
        assert!(chain.contains("caused by: disk full"));
    }
}

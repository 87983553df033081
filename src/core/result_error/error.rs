use crate::core::config::Span;
use crate::core::result_error::{AddFunctionName, AddMsg};
use crate::core::util::format_bytes;
use std::borrow::Cow;
use std::fmt::Debug;
use thiserror::Error;
use thiserror_ext;

#[derive(Error, Debug, thiserror_ext::Box, thiserror_ext::Construct)]
#[thiserror_ext(
    newtype(name = Error),
)]
pub enum ErrorInternal {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    StripPrefixError(#[from] std::path::StripPrefixError),
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
    #[error("{}: {}", span, reason)]
    ConfigSyntax { span: Span, reason: Cow<'static, str> },
    #[error("{}{}", span.as_ref().map(|s| format!("{s}: ")).unwrap_or_default(), message)]
    Validation {
        message: Cow<'static, str>,
        span: Option<Span>,
    },
    #[error("no plugin '{}' registered in namespace '{}'", name, namespace)]
    PluginNotFound { namespace: String, name: String },
    #[error("failed to load plugin '{}.{}':\n{}", namespace, name, indent::indent_all_with("  ", error.to_string()))]
    PluginLoad {
        namespace: String,
        name: String,
        error: Error,
    },
    #[error("'{}' already locked by process {}", backupset, pid)]
    SpoolLocked { backupset: String, pid: String },
    #[error("{0}")]
    Spool(Cow<'static, str>),
    #[error("{0}")]
    Backup(Cow<'static, str>),
    #[error("insufficient space for backup. Required: {} Available: {}",
            format_bytes(*required), format_bytes(*available))]
    InsufficientSpace { required: u64, available: u64 },
    #[error("{0}")]
    Archive(Cow<'static, str>),
    #[error("compression method '{}' not found on path", method)]
    StreamMethodNotFound { method: String },
    #[error("{0}")]
    Interrupted(Cow<'static, str>),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg {
        msg: Cow<'static, str>,
        error: Error,
    },
    #[error("{}() failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFnName {
        fn_name: Cow<'static, str>,
        error: Error,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl AddFunctionName for Error {
    fn add_fn_name<S: Into<Cow<'static, str>>>(self, fn_name: S) -> Self {
        Error::with_fn_name(fn_name.into(), self)
    }
}

impl<S: Into<Cow<'static, str>>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Self::with_msg(msg.into(), self)
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::lots_of_error(errors)
    }
}

impl Error {
    pub fn into_error_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self.into_inner() {
            ErrorInternal::LotsOfError(v) => Box::new(v.into_iter()),
            e => Box::new(std::iter::once(e.into())),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        let error_vec = match self.into_inner() {
            ErrorInternal::LotsOfError(mut v) => {
                v.extend(other.into_error_iter());
                v
            }
            e => vec![e.into(), other],
        };
        Error::lots_of_error(error_vec)
    }

    /// Whether this error (or any error it aggregates) is a lock conflict.
    pub fn is_lock_conflict(&self) -> bool {
        match self.inner() {
            ErrorInternal::SpoolLocked { .. } => true,
            ErrorInternal::WithMsg { error, .. } | ErrorInternal::WithFnName { error, .. } => {
                error.is_lock_conflict()
            }
            ErrorInternal::LotsOfError(v) => v.iter().any(Error::is_lock_conflict),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error);

        match error.inner() {
            ErrorInternal::Io(_) => (),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_with_msg() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error);
        let error_with_msg = error.add_msg("Custom message");

        match error_with_msg.inner() {
            ErrorInternal::WithMsg { msg, .. } => assert_eq!(msg, "Custom message"),
            _ => panic!("Expected WithMsg error"),
        }
    }

    #[test]
    fn test_error_from_vec() {
        let errors = vec![
            Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "error1")),
            Error::from(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "error2",
            )),
        ];

        let combined_error = Error::from(errors);
        match combined_error.inner() {
            ErrorInternal::LotsOfError(error_vec) => assert_eq!(error_vec.len(), 2),
            _ => panic!("Expected LotsOfError"),
        }
    }

    #[test]
    #[should_panic(expected = "Should not create lots of errors when error is empty")]
    fn test_error_from_empty_vec_panics() {
        let errors: Vec<Error> = vec![];
        let _error = Error::from(errors);
    }

    #[test]
    fn test_error_into_iter() {
        let error = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "test"));
        let mut iter = error.into_error_iter();

        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_error_chain() {
        let error1 = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "error1"));
        let error2 = Error::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "error2",
        ));

        let chained = error1.chain(error2);
        match chained.inner() {
            ErrorInternal::LotsOfError(errors) => assert_eq!(errors.len(), 2),
            _ => panic!("Expected LotsOfError"),
        }
    }

    #[test]
    fn test_spool_locked_display() {
        let error = Error::spool_locked("alpha", "1234");
        assert_eq!(error.to_string(), "'alpha' already locked by process 1234");
        assert!(error.is_lock_conflict());
        assert!(error.add_msg("outer").is_lock_conflict());
    }

    #[test]
    fn test_insufficient_space_display() {
        let error = Error::insufficient_space(2u64 * 1024 * 1024, 1024u64 * 1024);
        let text = error.to_string();
        assert!(text.contains("2.00MiB"), "{text}");
        assert!(text.contains("1.00MiB"), "{text}");
    }

    #[test]
    fn test_plugin_not_found_display() {
        let error = Error::plugin_not_found("holland.backup", "missing");
        assert_eq!(
            error.to_string(),
            "no plugin 'missing' registered in namespace 'holland.backup'"
        );
    }

    #[test]
    fn test_error_with_msg_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error);
        let error_with_msg = error.add_msg("Operation failed");
        assert_eq!(error_with_msg.to_string(), "Operation failed:\n  file not found");
    }
}

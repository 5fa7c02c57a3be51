//! Supporting utility type.
mod bytestr;
pub use bytestr::ByteStr;

/// Create unit type `Error`.
///
/// # Example
///
/// ```ignore
/// unit_error! {
///     /// Resource not found.
///     pub struct NotFound("not found");
/// }
/// ```
macro_rules! unit_error {
    ($(#[$meta:meta])* $vis:vis struct $name:ident($msg:literal);) => {
        $(#[$meta])*
        $vis struct $name;

        impl std::error::Error for $name { }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str($msg)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "\"{self}\"")
            }
        }
    };
}

/// Log via `log` when enabled, otherwise via `tracing` when `verbose` enabled.
macro_rules! trace {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        log::trace!($($tt)*);
        #[cfg(all(not(feature = "log"), feature = "verbose"))]
        tracing::trace!($($tt)*);
    };
}

macro_rules! warning {
    ($($tt:tt)*) => {
        #[cfg(feature = "log")]
        log::warn!($($tt)*);
        #[cfg(all(not(feature = "log"), feature = "verbose"))]
        tracing::warn!($($tt)*);
    };
}

pub(crate) use unit_error;
pub(crate) use trace;
pub(crate) use warning;

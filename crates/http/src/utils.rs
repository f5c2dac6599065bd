//! Helper macros used across the crate.

/// Returns early with `$error` when `$predicate` does not hold.
///
/// Works like `assert!`, but for protocol input that is allowed to be wrong.
///
/// ```ignore
/// ensure!(line.len() <= limits.max_line_bytes(), ParseError::line_too_long(line.len(), limits.max_line_bytes()));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;

//! Internal helper macros shared across the crate.

/// Early-return with an error when a condition does not hold.
///
/// Works like `assert!` except that it evaluates to `return Err(..)` instead
/// of panicking. The error expression goes through `Into`, so a narrow error
/// type can be raised from a function returning a wider one.
///
/// # Example
///
/// ```ignore
/// ensure!(content_length <= max, ParseError::body_too_large(content_length, max));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error.into());
        }
    };
}

pub(crate) use ensure;

/// Returns the offset of the first occurrence of `needle` in `haystack`.
/// An empty needle matches at offset zero.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

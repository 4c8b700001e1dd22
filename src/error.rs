//! Error code convention shared by every surfaced error type.
//!
//! DESIGN
//! ======
//! UI layers map failures to toasts and persistent error views. Rather than
//! matching on every enum, they read a grepable code and a retryable flag.

/// Grepable error code and retryable flag for user-facing failures.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

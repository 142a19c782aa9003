//! Fatal run-level errors.
//!
//! Anything that stops the whole run is an [`AppError`] carrying the process
//! exit code. Per-point conditions (singular models, coverage, all-NaN
//! likelihoods) are `PointIssue`s on the point's result instead.

/// Invalid configuration, unreadable or malformed inputs.
pub const EXIT_CONFIG: u8 = 2;
/// Inputs were readable but left nothing to estimate.
pub const EXIT_NO_DATA: u8 = 3;
/// Internal or numerical failure at run level.
pub const EXIT_INTERNAL: u8 = 4;

#[derive(Clone, PartialEq, Eq)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(EXIT_CONFIG, message)
    }

    pub fn no_data(message: impl Into<String>) -> Self {
        Self::new(EXIT_NO_DATA, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(EXIT_INTERNAL, message)
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_carry_exit_codes() {
        assert_eq!(AppError::config("bad").exit_code(), EXIT_CONFIG);
        assert_eq!(AppError::no_data("empty").exit_code(), EXIT_NO_DATA);
        let err = AppError::internal("boom");
        assert_eq!(err.exit_code(), EXIT_INTERNAL);
        assert_eq!(err.to_string(), "boom");
    }
}

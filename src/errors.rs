use std::fmt;

/// Custom error type for engine operations, including specific error codes.
///
/// Each variant represents a distinct error condition with a unique error code for easier debugging
/// and error handling in applications.
#[derive(Debug)]
pub enum Error {
    /// Structural storage error (e.g., deleting an absent key, inverted range bounds).
    /// Error code: 1000
    Storage(String),
    /// Engine-level error (e.g., unregistered bank or table).
    /// Error code: 2000
    Engine(String),
    /// Constraint violation (e.g., duplicate value in a unique column).
    /// Error code: 3000
    Constraint(String),
    /// Schema-related error (e.g., missing non-nullable column, type mismatch).
    /// Error code: 5000
    Schema(String),
    /// Transaction misuse (e.g., re-entrant begin, rollback without begin).
    /// Error code: 6000
    Transaction(String),
    /// Invalid operation (e.g., mutating a primary-key field).
    /// Error code: 7000
    InvalidOperation(String),
    /// Miscellaneous uncategorized error.
    /// Error code: 9000
    Other(String),
}

impl Error {
    /// Returns the error code associated with this error variant.
    ///
    /// # Examples
    /// ```
    /// use ledgerlite::errors::Error;
    /// let err = Error::Storage("Key not found".to_string());
    /// assert_eq!(err.code(), 1000);
    /// ```
    pub fn code(&self) -> u32 {
        match self {
            Error::Storage(_) => 1000,
            Error::Engine(_) => 2000,
            Error::Constraint(_) => 3000,
            Error::Schema(_) => 5000,
            Error::Transaction(_) => 6000,
            Error::InvalidOperation(_) => 7000,
            Error::Other(_) => 9000,
        }
    }

    /// Returns a human-readable error category for this error variant.
    ///
    /// # Examples
    /// ```
    /// use ledgerlite::errors::Error;
    /// let err = Error::Constraint("Duplicate email".to_string());
    /// assert_eq!(err.category(), "Constraint");
    /// ```
    pub fn category(&self) -> &'static str {
        match self {
            Error::Storage(_) => "Storage",
            Error::Engine(_) => "Engine",
            Error::Constraint(_) => "Constraint",
            Error::Schema(_) => "Schema",
            Error::Transaction(_) => "Transaction",
            Error::InvalidOperation(_) => "Invalid Operation",
            Error::Other(_) => "Other",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Storage(msg) => write!(f, "[{}] Storage Error: {}", self.code(), msg),
            Error::Engine(msg) => write!(f, "[{}] Engine Error: {}", self.code(), msg),
            Error::Constraint(msg) => write!(f, "[{}] Constraint Error: {}", self.code(), msg),
            Error::Schema(msg) => write!(f, "[{}] Schema Error: {}", self.code(), msg),
            Error::Transaction(msg) => {
                write!(f, "[{}] Transaction Error: {}", self.code(), msg)
            }
            Error::InvalidOperation(msg) => {
                write!(f, "[{}] Invalid Operation: {}", self.code(), msg)
            }
            Error::Other(msg) => write!(f, "[{}] Unknown Error: {}", self.code(), msg),
        }
    }
}

impl std::error::Error for Error {}

/// Convenience macro to create an `Error` with a formatted message.
///
/// # Examples
/// ```
/// use ledgerlite::err;
/// let err = err!(Constraint, "Duplicate username");
/// assert_eq!(err.code(), 3000);
/// assert_eq!(err.to_string(), "[3000] Constraint Error: Duplicate username");
///
/// let err = err!(Engine, "Table '{}' is not registered", "users");
/// assert_eq!(err.code(), 2000);
/// assert_eq!(err.to_string(), "[2000] Engine Error: Table 'users' is not registered");
/// ```
#[macro_export]
macro_rules! err {
    ($variant:ident, $msg:expr) => {
        $crate::errors::Error::$variant($msg.to_string())
    };
    ($variant:ident, $fmt:expr, $($arg:tt)*) => {
        $crate::errors::Error::$variant(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_and_display() {
        let err = Error::Schema("Missing value for column: email".to_string());
        assert_eq!(err.code(), 5000);
        assert_eq!(
            err.to_string(),
            "[5000] Schema Error: Missing value for column: email"
        );
        assert_eq!(err.category(), "Schema");
    }

    #[test]
    fn test_error_macro() {
        let err = err!(Transaction, "Transaction already in progress");
        assert_eq!(err.code(), 6000);
        assert_eq!(
            err.to_string(),
            "[6000] Transaction Error: Transaction already in progress"
        );

        let err = err!(Storage, "Key {} not found", 42);
        assert_eq!(err.code(), 1000);
        assert_eq!(err.to_string(), "[1000] Storage Error: Key 42 not found");
    }
}

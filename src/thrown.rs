//! Errors thrown by test bodies and loop callbacks
//!
//! [`Thrown`] plays the role of an exception object: it remembers the name of
//! the type that was raised together with its message, so a failure can be
//! reported with its provenance after it crossed the event loop.

use std::any::{type_name, Any};
use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Boxed error accepted from callers that already erased their error type
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result returned by loop callbacks and detached tasks
pub type CallbackResult = std::result::Result<(), Thrown>;

/// Type name recorded for values raised through `panic!`
pub const PANIC_TYPE_NAME: &str = "panic";

/// An error raised by test code, with the name of the type that raised it
#[derive(Debug)]
pub struct Thrown {
    type_name: Cow<'static, str>,
    message: String,
    origin: Origin,
}

#[derive(Debug)]
enum Origin {
    Error(BoxError),
    Panic,
    Custom,
}

impl Thrown {
    /// Wrap an error value, recording its concrete type name
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            type_name: Cow::Borrowed(type_name::<E>()),
            message: error.to_string(),
            origin: Origin::Error(Box::new(error)),
        }
    }

    /// Wrap an already boxed error; its concrete type is no longer known
    pub fn from_boxed(error: BoxError) -> Self {
        Self {
            type_name: Cow::Borrowed("Box<dyn Error>"),
            message: error.to_string(),
            origin: Origin::Error(error),
        }
    }

    /// Build a thrown value with an explicit type name and message
    pub fn custom(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: Cow::Owned(type_name.into()),
            message: message.into(),
            origin: Origin::Custom,
        }
    }

    /// Convert a panic payload captured by `catch_unwind`
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "Box<dyn Any>".to_string()
        };

        Self {
            type_name: Cow::Borrowed(PANIC_TYPE_NAME),
            message,
            origin: Origin::Panic,
        }
    }

    /// Name of the raised type, safe for interpolation into messages
    pub fn type_name(&self) -> Cow<'_, str> {
        sanitize_type_name(&self.type_name)
    }

    /// Message carried by the raised value
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this value came from a panic (assertion macros, [`fail`])
    pub fn is_panic(&self) -> bool {
        matches!(self.origin, Origin::Panic)
    }

    /// Borrow the wrapped error if it has type `E`
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match &self.origin {
            Origin::Error(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Whether the wrapped error has type `E`
    pub fn is<E>(&self) -> bool
    where
        E: StdError + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    /// Take the wrapped error out, if this value wraps one
    pub fn into_source(self) -> Option<BoxError> {
        match self.origin {
            Origin::Error(error) => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name(), self.message)
    }
}

impl<E> From<E> for Thrown
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Thrown::new(error)
    }
}

/// Replace control characters (NUL included) so a type name prints on one line
pub fn sanitize_type_name(name: &str) -> Cow<'_, str> {
    if name.chars().any(char::is_control) {
        Cow::Owned(
            name.chars()
                .map(|c| if c.is_control() { '@' } else { c })
                .collect(),
        )
    } else {
        Cow::Borrowed(name)
    }
}

/// Generic error for tests that expect something to throw.
///
/// ```
/// use loop_test::{fail, TestException};
///
/// fn should_throw() -> Result<(), TestException> {
///     Err(TestException::new("expected"))
/// }
///
/// match should_throw() {
///     Ok(()) => fail("Expected should_throw() to throw."),
///     Err(e) => assert_eq!(e.message(), "expected"),
/// }
/// ```
#[derive(Error, Debug, Clone, Default, PartialEq, Eq)]
#[error("{message}")]
pub struct TestException {
    message: String,
}

impl TestException {
    /// Create an exception carrying `message`
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message this exception was created with
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Fail the current test with `message`.
///
/// Inside a test body the panic is captured by the driver and reported as an
/// assertion failure; everywhere else it behaves like `panic!`.
#[track_caller]
pub fn fail(message: impl Into<String>) -> ! {
    panic!("{}", message.into())
}

/// Fail unless `actual >= expected`
#[track_caller]
pub fn assert_greater_or_equal<T>(expected: T, actual: T, message: &str)
where
    T: PartialOrd + fmt::Debug,
{
    if let Err(failure) = greater_or_equal(&expected, &actual, message) {
        fail(failure);
    }
}

/// Comparison behind [`assert_greater_or_equal`], returning the failure text
pub(crate) fn greater_or_equal<T>(expected: &T, actual: &T, message: &str) -> std::result::Result<(), String>
where
    T: PartialOrd + fmt::Debug,
{
    if actual < expected {
        return Err(format!(
            "{}\nFailed asserting that {:?} is equal to {:?} or is greater than {:?}.",
            message, actual, expected, expected
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;

    #[test]
    fn test_thrown_records_type_name() {
        let thrown = Thrown::from(TestException::new("message"));
        assert_eq!(thrown.type_name(), "loop_test::thrown::TestException");
        assert_eq!(thrown.message(), "message");
        assert!(thrown.is::<TestException>());
        assert!(!thrown.is_panic());
    }

    #[test]
    fn test_thrown_from_panic_payload() {
        let payload = catch_unwind(|| fail("nope")).unwrap_err();
        let thrown = Thrown::from_panic(payload);
        assert!(thrown.is_panic());
        assert_eq!(thrown.type_name(), PANIC_TYPE_NAME);
        assert_eq!(thrown.message(), "nope");
    }

    #[test]
    fn test_sanitize_replaces_nul_byte() {
        let thrown = Thrown::custom("class@anonymous\0/src/test.rs", "boom");
        assert_eq!(thrown.type_name(), "class@anonymous@/src/test.rs");
        assert_eq!(sanitize_type_name("plain::Name"), "plain::Name");
    }

    #[test]
    fn test_assert_greater_or_equal() {
        assert_greater_or_equal(100, 100, "equal is fine");
        let payload = catch_unwind(|| assert_greater_or_equal(100, 75, "too small")).unwrap_err();
        let message = Thrown::from_panic(payload).message().to_string();
        assert!(message.starts_with("too small"));
        assert!(message.contains("Failed asserting that 75 is equal to 100"));
    }
}

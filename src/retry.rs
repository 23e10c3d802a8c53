//! Timeouts and bounded retries for calls to external services, built on
//! [`keen_retry`]'s retry API.
//!
//! Every call to a state store, object store, queue or workflow engine may
//! block on the network. We wrap each attempt in a timeout, and we retry a
//! small, fixed number of times if the failure looks transient. Anything
//! beyond that is left to the at-least-once delivery of whoever invoked us.

use std::{error, fmt, time::Duration};

use aws_smithy_runtime_api::{
    client::{orchestrator::HttpResponse, result::SdkError},
    http::StatusCode as AwsStatusCode,
};
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use tokio::time;

use crate::prelude::*;

/// A [`RetryResult`] for a single call attempt.
pub type CallRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// On error, return either a [`RetryResult::Transient`] or [`RetryResult::Fatal`]
/// value, depending on the return value of [`IsKnownTransient::is_known_transient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => return $crate::retry::retry_result_from_error(error),
        }
    };
}

/// On error, return a [`RetryResult::Fatal`] value.
macro_rules! try_fatal {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

pub(crate) use {try_fatal, try_potentially_transient};

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Classify `error` as transient or fatal.
pub(crate) fn retry_result_from_error<T, E>(error: E) -> CallRetryResult<T>
where
    E: IsKnownTransient + error::Error + Send + Sync + 'static,
{
    if error.is_known_transient() {
        debug!("Potentially transient error: {:?}", error);
        RetryResult::Transient {
            input: (),
            error: From::from(error),
        }
    } else {
        RetryResult::Fatal {
            input: (),
            error: From::from(error),
        }
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient until they have been
/// observed in the wild and shown to be transient. This keeps us from
/// retrying errors that will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for AwsStatusCode {
    fn is_known_transient(&self) -> bool {
        matches!(self.as_u16(), 429 | 500 | 502 | 503 | 504)
    }
}

/// AWS error codes that mean "slow down" or "try again".
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "ThrottlingException",
    "Throttling",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "InternalServerError",
    "InternalServerException",
    "ServiceUnavailable",
    "SlowDown",
];

impl<E> IsKnownTransient for SdkError<E, HttpResponse>
where
    E: ProvideErrorMetadata,
{
    fn is_known_transient(&self) -> bool {
        match self {
            SdkError::TimeoutError(_) => true,
            SdkError::DispatchFailure(dispatch) => {
                dispatch.is_io() || dispatch.is_timeout()
            }
            SdkError::ResponseError(response) => {
                response.raw().status().is_known_transient()
            }
            SdkError::ServiceError(service_err) => {
                service_err
                    .err()
                    .code()
                    .is_some_and(|code| TRANSIENT_ERROR_CODES.contains(&code))
                    || service_err.raw().status().is_known_transient()
            }
            _ => false,
        }
    }
}

/// An error from a single call to an external service.
#[derive(Debug)]
pub enum CallError<E> {
    /// The service returned an error.
    Native(E),

    /// The call did not finish in time.
    Timeout,
}

impl<E> CallError<E> {
    /// The service's own error, if there was one.
    pub fn native(&self) -> Option<&E> {
        match self {
            CallError::Native(err) => Some(err),
            CallError::Timeout => None,
        }
    }
}

impl<E> IsKnownTransient for CallError<E>
where
    E: IsKnownTransient,
{
    fn is_known_transient(&self) -> bool {
        match self {
            CallError::Native(err) => err.is_known_transient(),
            CallError::Timeout => true,
        }
    }
}

impl<E> fmt::Display for CallError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Native(err) => write!(f, "service error: {err}"),
            CallError::Timeout => write!(f, "service call timed out"),
        }
    }
}

impl<E> error::Error for CallError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            CallError::Native(err) => Some(err),
            CallError::Timeout => None,
        }
    }
}

/// Options shared by every call to an external service.
#[derive(Clone, Copy, Debug)]
pub struct CallOpts {
    /// How long a single attempt may take.
    pub timeout: Duration,
}

impl CallOpts {
    /// Run `future` with our timeout.
    pub async fn call<T, E>(
        &self,
        future: impl Future<Output = Result<T, E>>,
    ) -> Result<T, CallError<E>> {
        match time::timeout(self.timeout, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(CallError::Native(err)),
            Err(_) => Err(CallError::Timeout),
        }
    }
}

/// Run `call`, retrying transient failures with exponential backoff.
///
/// `what` describes the call for error messages, like "query page records".
pub async fn with_retries<T, F, Fut>(what: &str, call: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = CallRetryResult<T>>,
{
    let jitter = ExponentialJitter::FromBackoffRange {
        backoff_range_millis: 50..=5_000,
        re_attempts: 3,
        jitter_ratio: 0.2,
    };
    let result = call()
        .await
        .retry_with_async(|_| call())
        .with_exponential_jitter(|| jitter)
        .await
        .inspect_recovered(|_, _, retry_errors_list| {
            warn!(
                "{what} succeeded after retrying {} times (failed attempts: [{}])",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        })
        .inspect_given_up(|_, retry_errors_list, fatal_error| {
            error!(
                "{what} FAILED after {} retries with error {fatal_error:?}. Previous transient failures: [{}]",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        });
    let result = match result {
        ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
            Ok(output)
        }
        ResolvedResult::Fatal { error, .. } => Err(error),
        ResolvedResult::GivenUp { fatal_error, .. }
        | ResolvedResult::Unrecoverable { fatal_error, .. } => Err(fatal_error),
    };
    result.with_context(|| format!("failed to {what}"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct FlakyError {
        transient: bool,
    }

    impl fmt::Display for FlakyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "flaky (transient: {})", self.transient)
        }
    }

    impl error::Error for FlakyError {}

    impl IsKnownTransient for FlakyError {
        fn is_known_transient(&self) -> bool {
            self.transient
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let attempts = AtomicUsize::new(0);
        let result = with_retries("flaky call", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                try_potentially_transient!(Err(FlakyError { transient: true }));
            }
            retry_result_ok(42)
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = with_retries("fatal call", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            try_potentially_transient!(Err(FlakyError { transient: false }));
            retry_result_ok(())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_are_transient() {
        let opts = CallOpts {
            timeout: Duration::from_millis(10),
        };
        let result = opts
            .call(async {
                time::sleep(Duration::from_secs(5)).await;
                Ok::<_, FlakyError>(())
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, CallError::Timeout));
        assert!(err.is_known_transient());
    }
}

use backoff::{retry, ExponentialBackoff};
use slog::{debug, info, Logger};
use std::{fmt::Debug, time::Duration};

/// Executes the provided action `f`, retrying with exponential backoff if the
/// error returned by `f` is deemed retryable by `is_retryable`. On success,
/// returns the value returned by `f`. On failure, returns the error returned
/// by the last attempt to call `f`. Retryable failures will be logged using
/// the provided logger.
pub(crate) fn retry_request<F, T, E, R>(logger: &Logger, f: F, is_retryable: R) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    R: FnMut(&E) -> bool,
    E: Debug,
{
    // The ingest endpoint is expected to absorb bursts, so a short initial
    // interval with a capped ceiling keeps delivery latency low while still
    // backing off hard on sustained outages.
    retry_request_with_params(
        logger,
        Duration::from_secs(1),
        Duration::from_secs(30),
        Duration::from_secs(600),
        f,
        is_retryable,
    )
}

/// Private version of retry_request that exposes parameters for backoff.
/// Should only be used for testing. Otherwise behaves identically to
/// `retry_request`.
fn retry_request_with_params<F, T, E, R>(
    logger: &Logger,
    backoff_initial_interval: Duration,
    backoff_max_interval: Duration,
    backoff_max_elapsed: Duration,
    mut f: F,
    mut is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    R: FnMut(&E) -> bool,
    E: Debug,
{
    let backoff = ExponentialBackoff {
        initial_interval: backoff_initial_interval,
        max_interval: backoff_max_interval,
        multiplier: 2.0,
        max_elapsed_time: Some(backoff_max_elapsed),
        ..Default::default()
    };

    retry(backoff, || {
        // Invoke the function and wrap its E into backoff::Error
        f().map_err(|error| {
            if is_retryable(&error) {
                info!(
                    logger, "encountered retryable error";
                    "error" => format!("{:?}", error),
                );
                backoff::Error::Transient {
                    err: error,
                    retry_after: None,
                }
            } else {
                debug!(logger, "encountered non-retryable error");
                backoff::Error::Permanent(error)
            }
        })
    })
    // Unwrap the backoff::Error to get the E back and let the caller wrap
    // that in whatever they want
    .map_err(|e| match e {
        backoff::Error::Permanent(inner) => inner,
        backoff::Error::Transient { err: inner, .. } => inner,
    })
}

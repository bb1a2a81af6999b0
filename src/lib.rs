#![allow(clippy::too_many_arguments)]

use crate::{
    export::ExportError,
    flowlog::{FlowLogParseError, FlowLogValidationError},
    ingest::TriggerEventError,
};
use anyhow::Result;
use url::Url;

pub mod aws_credentials;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod export;
pub mod flowlog;
pub mod http;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod otlp;
pub mod pipeline;
mod retries;
pub mod secrets;
pub mod staged;
pub mod task;
mod work_queue;

/// Hard cap on the number of log records shipped in a single outbound
/// request. Sub-batches that grow past this are flushed and restarted.
pub const MAX_RECORDS_PER_REQUEST: usize = 1000;

/// Identifier stamped into the `telemetry.sdk.name` resource attribute of
/// every outbound payload.
pub const FORWARDER_ID: &str = "logship";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
    #[error("trigger event error: {0}")]
    TriggerEvent(#[from] TriggerEventError),
    #[error("flow log parse error: {0}")]
    FlowLogParse(#[from] FlowLogParseError),
    #[error("flow log validation error: {0}")]
    FlowLogValidation(#[from] FlowLogValidationError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("command line parsing error: {0}")]
    Clap(#[from] clap::Error),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Url(#[from] UrlParseError),
}

/// This trait captures whether a given error is due to corruption in the
/// delivered log data, in which case re-processing the same input cannot
/// succeed, or due to I/O errors or cloud service API errors, in which case
/// the delivery should be redelivered and retried later.
pub trait ErrorClassification {
    fn is_retryable(&self) -> bool;
}

impl ErrorClassification for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Catch-all error type -- retries OK.
            Error::AnyhowError(_) => true,
            // Corrupt input stays corrupt no matter how often we look at it.
            Error::TriggerEvent(_) | Error::FlowLogParse(_) | Error::FlowLogValidation(_) => false,
            // These indicate a problem with how this process was invoked or
            // configured, which an operator may fix while the delivery waits
            // in the queue.
            Error::Clap(_) | Error::Config(_) | Error::Url(_) => true,
            // Dispatch to the wrapped error type.
            Error::Export(e) => e.is_retryable(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to parse: {1}, {0}")]
pub struct UrlParseError(url::ParseError, String);

pub fn parse_url(input: String) -> Result<Url, UrlParseError> {
    Url::parse(&input).map_err(|e| UrlParseError(e, input))
}

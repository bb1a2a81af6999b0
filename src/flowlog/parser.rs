use crate::flowlog::{
    protocol::protocol_name,
    validate::{validate, FlowLogValidationError, DEFAULT_FIELD_NAMES},
    FlowLogRecord, DEFAULT_FIELD_COUNT, MAX_TESTED_VERSION,
};
use slog::{debug, Logger};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowLogParseError {
    #[error("expected {expected} fields, found {actual}")]
    FieldCount { expected: usize, actual: usize },
    #[error("malformed format token {0:?}, expected ${{field-name}}")]
    MalformedFormatToken(String),
    #[error("format string is empty")]
    EmptyFormat,
}

/// A parse or validation failure for one flow log record. Either way the
/// record is dropped and the stream continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowLogError {
    #[error(transparent)]
    Parse(#[from] FlowLogParseError),
    #[error(transparent)]
    Validation(#[from] FlowLogValidationError),
}

/// The set of provider field names mentioned by a custom format string.
/// Fields outside the set were never assigned and are exempt from
/// non-emptiness checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPresence(HashSet<String>);

impl FieldPresence {
    pub fn contains(&self, provider_name: &str) -> bool {
        self.0.contains(provider_name)
    }
}

/// A parsed custom format string: the positional field names plus their
/// presence set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowLogFormat {
    field_names: Vec<String>,
    presence: FieldPresence,
}

impl FlowLogFormat {
    /// Parses a format string of the shape `${name} ${name} …`. Every token
    /// must carry the `${…}` wrapper; the names themselves are not checked
    /// here, since unknown fields are legal (and skipped) during record
    /// parsing.
    pub fn parse(format: &str) -> Result<FlowLogFormat, FlowLogParseError> {
        let mut field_names = Vec::new();
        for token in format.split_whitespace() {
            let name = token
                .strip_prefix("${")
                .and_then(|rest| rest.strip_suffix('}'))
                .ok_or_else(|| FlowLogParseError::MalformedFormatToken(token.to_owned()))?;
            if name.is_empty() {
                return Err(FlowLogParseError::MalformedFormatToken(token.to_owned()));
            }
            field_names.push(name.to_owned());
        }
        if field_names.is_empty() {
            return Err(FlowLogParseError::EmptyFormat);
        }

        let presence = FieldPresence(field_names.iter().cloned().collect());
        Ok(FlowLogFormat {
            field_names,
            presence,
        })
    }

    pub fn field_count(&self) -> usize {
        self.field_names.len()
    }

    pub fn presence(&self) -> &FieldPresence {
        &self.presence
    }
}

/// Parses flow log lines in either the default positional layout or a
/// custom format-string-driven layout. Both entry points share the record
/// validator.
#[derive(Debug, Clone)]
pub struct FlowLogParser {
    logger: Logger,
}

impl FlowLogParser {
    pub fn new(parent_logger: &Logger) -> FlowLogParser {
        FlowLogParser {
            logger: parent_logger.clone(),
        }
    }

    /// Parses a line in the default fourteen-field layout and validates it.
    pub fn parse_default(&self, line: &str) -> Result<FlowLogRecord, FlowLogError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != DEFAULT_FIELD_COUNT {
            return Err(FlowLogParseError::FieldCount {
                expected: DEFAULT_FIELD_COUNT,
                actual: tokens.len(),
            }
            .into());
        }

        let mut record = FlowLogRecord::default();
        for (name, token) in DEFAULT_FIELD_NAMES.into_iter().zip(tokens) {
            record.set_field(name, token);
        }
        self.finish(&mut record);

        validate(&record, None)?;
        Ok(record)
    }

    /// Parses a line laid out according to the provided custom format and
    /// validates it, enforcing that the format carries every default field.
    pub fn parse_custom(
        &self,
        line: &str,
        format: &FlowLogFormat,
    ) -> Result<FlowLogRecord, FlowLogError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != format.field_count() {
            return Err(FlowLogParseError::FieldCount {
                expected: format.field_count(),
                actual: tokens.len(),
            }
            .into());
        }

        let mut record = FlowLogRecord::default();
        for (name, token) in format.field_names.iter().zip(tokens) {
            record.set_field(name, token);
        }
        self.finish(&mut record);

        validate(&record, Some(format.presence()))?;
        Ok(record)
    }

    fn finish(&self, record: &mut FlowLogRecord) {
        record.protocol_name = protocol_name(&record.protocol);

        let version = record.version.parse::<i64>().unwrap_or(0);
        if version > MAX_TESTED_VERSION {
            debug!(
                self.logger,
                "flow log version {} is newer than the highest tested version {}",
                version,
                MAX_TESTED_VERSION
            );
        }
    }
}

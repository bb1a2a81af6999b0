use crate::flowlog::{parser::FieldPresence, FlowLogRecord, MINIMUM_VERSION};
use std::fmt;

/// The default-layout field names, in positional order, using the provider's
/// kebab-case spelling. Validation iterates these; extended fields are not
/// validated beyond type conversion.
pub(crate) const DEFAULT_FIELD_NAMES: [&str; 14] = [
    "version",
    "account-id",
    "interface-id",
    "srcaddr",
    "dstaddr",
    "srcport",
    "dstport",
    "protocol",
    "packets",
    "bytes",
    "start",
    "end",
    "action",
    "log-status",
];

/// A record violated a field contract. Field names are always reported in
/// the provider's kebab-case spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowLogValidationError {
    pub field: String,
    pub expected: Option<String>,
    pub actual: String,
    pub message: String,
}

impl fmt::Display for FlowLogValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: field \"{}\"", self.message, self.field)?;
        if let Some(expected) = &self.expected {
            write!(f, ", expected {}", expected)?;
        }
        write!(f, ", actual \"{}\"", self.actual)
    }
}

impl std::error::Error for FlowLogValidationError {}

impl FlowLogValidationError {
    fn new(field: &str, expected: Option<&str>, actual: impl fmt::Display, message: &str) -> Self {
        FlowLogValidationError {
            field: field.to_owned(),
            expected: expected.map(str::to_owned),
            actual: actual.to_string(),
            message: message.to_owned(),
        }
    }
}

enum FieldValue<'a> {
    Text(&'a str),
    Integer(i64),
}

fn default_field_value<'a>(record: &'a FlowLogRecord, name: &str) -> FieldValue<'a> {
    match name {
        "version" => FieldValue::Text(&record.version),
        "account-id" => FieldValue::Text(&record.account_id),
        "interface-id" => FieldValue::Text(&record.interface_id),
        "srcaddr" => FieldValue::Text(&record.src_addr),
        "dstaddr" => FieldValue::Text(&record.dst_addr),
        "srcport" => FieldValue::Text(&record.src_port),
        "dstport" => FieldValue::Text(&record.dst_port),
        "protocol" => FieldValue::Text(&record.protocol),
        "packets" => FieldValue::Integer(record.packets),
        "bytes" => FieldValue::Integer(record.bytes),
        "start" => FieldValue::Integer(record.start),
        "end" => FieldValue::Integer(record.end),
        "action" => FieldValue::Text(&record.action),
        "log-status" => FieldValue::Text(&record.log_status),
        other => unreachable!("not a default field: {other}"),
    }
}

/// Validates a parsed record against the field contracts of the default
/// layout. `presence` describes which fields the record's format carries;
/// `None` means the default format, where every default field is mandatory.
///
/// A custom format must mention every default field; a missing one fails
/// before any value is inspected.
pub fn validate(
    record: &FlowLogRecord,
    presence: Option<&FieldPresence>,
) -> Result<(), FlowLogValidationError> {
    if let Some(presence) = presence {
        for name in DEFAULT_FIELD_NAMES {
            if !presence.contains(name) {
                return Err(FlowLogValidationError::new(
                    name,
                    None,
                    "",
                    "Missing required field",
                ));
            }
        }
    }

    let is_present = |name: &str| match presence {
        Some(presence) => presence.contains(name),
        None => true,
    };

    for name in DEFAULT_FIELD_NAMES {
        if !is_present(name) {
            continue;
        }
        match default_field_value(record, name) {
            FieldValue::Text(value) => {
                if value.is_empty() {
                    return Err(FlowLogValidationError::new(
                        name,
                        Some("non-empty value"),
                        value,
                        "Field must not be empty",
                    ));
                }
            }
            FieldValue::Integer(value) => {
                if value < 0 {
                    return Err(FlowLogValidationError::new(
                        name,
                        Some(">= 0"),
                        value,
                        "Field must not be negative",
                    ));
                }
            }
        }
    }

    if is_present("version") {
        let version = record.version.parse::<i64>().unwrap_or(0);
        if version < MINIMUM_VERSION {
            let expected = format!(">= {MINIMUM_VERSION}");
            return Err(FlowLogValidationError::new(
                "version",
                Some(&expected),
                &record.version,
                "Unsupported flow log version",
            ));
        }
    }

    if is_present("account-id") {
        let account = &record.account_id;
        if account.len() != 12 || !account.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FlowLogValidationError::new(
                "account-id",
                Some("12 digits"),
                account,
                "Malformed account id",
            ));
        }
    }

    if is_present("action") && !matches!(record.action.as_str(), "ACCEPT" | "REJECT") {
        return Err(FlowLogValidationError::new(
            "action",
            Some("ACCEPT or REJECT"),
            &record.action,
            "Unrecognized action",
        ));
    }

    if is_present("log-status") && !matches!(record.log_status.as_str(), "OK" | "NODATA" | "SKIPDATA")
    {
        return Err(FlowLogValidationError::new(
            "log-status",
            Some("OK, NODATA or SKIPDATA"),
            &record.log_status,
            "Unrecognized log status",
        ));
    }

    if is_present("start") && is_present("end") && record.start > record.end {
        return Err(FlowLogValidationError::new(
            "start",
            Some("start <= end"),
            record.start,
            "Flow window is inverted",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowlog::parser::FlowLogFormat;

    fn valid_record() -> FlowLogRecord {
        FlowLogRecord {
            version: "2".to_owned(),
            account_id: "123456789012".to_owned(),
            interface_id: "eni-0a".to_owned(),
            src_addr: "10.0.0.1".to_owned(),
            dst_addr: "10.0.0.2".to_owned(),
            src_port: "443".to_owned(),
            dst_port: "49152".to_owned(),
            protocol: "6".to_owned(),
            packets: 25,
            bytes: 4000,
            start: 1_620_000_000,
            end: 1_620_000_060,
            action: "ACCEPT".to_owned(),
            log_status: "OK".to_owned(),
            ..FlowLogRecord::default()
        }
    }

    #[test]
    fn valid_record_passes() {
        validate(&valid_record(), None).unwrap();
    }

    #[test]
    fn empty_string_field_fails() {
        let mut record = valid_record();
        record.interface_id.clear();
        let err = validate(&record, None).unwrap_err();
        assert_eq!(err.field, "interface-id");
        assert!(err.message.contains("empty"));
    }

    #[test]
    fn negative_integer_field_fails() {
        let mut record = valid_record();
        record.bytes = -1;
        let err = validate(&record, None).unwrap_err();
        assert_eq!(err.field, "bytes");
        assert_eq!(err.expected.as_deref(), Some(">= 0"));
    }

    #[test]
    fn inverted_window_fails() {
        let mut record = valid_record();
        record.start = record.end + 1;
        let err = validate(&record, None).unwrap_err();
        assert_eq!(err.field, "start");
    }

    #[test]
    fn account_id_must_be_twelve_digits() {
        for bad in ["12345678901", "1234567890123", "12345678901x", "abcdefghijkl"] {
            let mut record = valid_record();
            record.account_id = bad.to_owned();
            let err = validate(&record, None).unwrap_err();
            assert_eq!(err.field, "account-id", "account {bad}");
        }
    }

    #[test]
    fn action_and_log_status_enums() {
        let mut record = valid_record();
        record.action = "DROP".to_owned();
        let err = validate(&record, None).unwrap_err();
        assert_eq!(err.field, "action");

        let mut record = valid_record();
        record.log_status = "MAYBE".to_owned();
        let err = validate(&record, None).unwrap_err();
        assert_eq!(err.field, "log-status");
    }

    #[test]
    fn old_version_rejected() {
        let mut record = valid_record();
        record.version = "1".to_owned();
        let err = validate(&record, None).unwrap_err();
        assert_eq!(err.field, "version");

        // An unparseable version behaves like version 0.
        let mut record = valid_record();
        record.version = "two".to_owned();
        validate(&record, None).unwrap_err();
    }

    #[test]
    fn custom_format_missing_default_field() {
        // Format omits account-id entirely.
        let format = FlowLogFormat::parse(
            "${version} ${interface-id} ${srcaddr} ${dstaddr} ${srcport} ${dstport} \
             ${protocol} ${packets} ${bytes} ${start} ${end} ${action} ${log-status}",
        )
        .unwrap();

        let err = validate(&valid_record(), Some(format.presence())).unwrap_err();
        assert_eq!(err.field, "account-id");
        assert!(err.message.contains("Missing required field"));
    }

    #[test]
    fn presence_gates_value_checks() {
        // All default fields present but the record's optional extras are
        // untouched: validation only looks at what the format mentions.
        let format = FlowLogFormat::parse(crate::flowlog::DEFAULT_FORMAT).unwrap();
        validate(&valid_record(), Some(format.presence())).unwrap();
    }
}

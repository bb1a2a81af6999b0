//! Parsing, validation and metric shaping for VPC flow log records, plus the
//! process-wide cache of per-log-group format strings.

mod cache;
mod format;
mod metrics;
mod parser;
mod protocol;
mod validate;

pub use cache::{CachedFormat, FormatCache};
pub use format::{DescribeFlowLogsFormatSource, FlowLogFormatSource, FormatLookup};
pub use metrics::build_flow_metrics;
pub use parser::{FieldPresence, FlowLogError, FlowLogFormat, FlowLogParseError, FlowLogParser};
pub use protocol::protocol_name;
pub use validate::{validate, FlowLogValidationError};

/// The provider's default flow log layout: fourteen positional fields.
pub const DEFAULT_FORMAT: &str = "${version} ${account-id} ${interface-id} ${srcaddr} ${dstaddr} \
     ${srcport} ${dstport} ${protocol} ${packets} ${bytes} ${start} ${end} ${action} ${log-status}";

/// Number of fields in the default layout.
pub const DEFAULT_FIELD_COUNT: usize = 14;

/// The lowest record version this forwarder accepts.
pub const MINIMUM_VERSION: i64 = 2;

/// The highest record version this forwarder has been exercised against.
/// Newer versions still parse; the parser just notes them.
pub const MAX_TESTED_VERSION: i64 = 8;

/// A single parsed flow log record. String fields keep the provider's raw
/// token; integer fields default to 0 when missing or unparseable. Field
/// names follow the internal snake_case key set; the provider's kebab-case
/// spelling is only used in formats and validation errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowLogRecord {
    pub version: String,
    pub account_id: String,
    pub interface_id: String,
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: String,
    pub dst_port: String,
    pub protocol: String,
    pub packets: i64,
    pub bytes: i64,
    pub start: i64,
    pub end: i64,
    pub action: String,
    pub log_status: String,

    // Fields introduced by format versions 3 and up. All optional; absent
    // fields stay at their default.
    pub vpc_id: String,
    pub subnet_id: String,
    pub instance_id: String,
    pub tcp_flags: i64,
    pub flow_type: String,
    pub pkt_srcaddr: String,
    pub pkt_dstaddr: String,
    pub region: String,
    pub az_id: String,
    pub sublocation_type: String,
    pub sublocation_id: String,
    pub pkt_src_aws_service: String,
    pub pkt_dst_aws_service: String,
    pub flow_direction: String,
    pub traffic_path: i64,
    pub ecs_cluster_arn: String,
    pub ecs_cluster_name: String,
    pub ecs_container_instance_arn: String,
    pub ecs_container_instance_id: String,
    pub ecs_container_id: String,
    pub ecs_second_container_id: String,
    pub ecs_service_name: String,
    pub ecs_task_definition_arn: String,
    pub ecs_task_arn: String,
    pub ecs_task_id: String,
    pub reject_reason: String,
    pub resource_id: String,
    pub encryption_status: String,

    /// Computed from `protocol` after parsing; not a provider field.
    pub protocol_name: String,
}

fn parse_integer(token: &str) -> i64 {
    token.parse().unwrap_or(0)
}

impl FlowLogRecord {
    /// Assigns a positional token to the field with the given provider
    /// (kebab-case) name, converting to the field's declared type. Unknown
    /// names are skipped so that newer formats keep parsing.
    pub fn set_field(&mut self, provider_name: &str, token: &str) {
        match provider_name {
            "version" => self.version = token.to_owned(),
            "account-id" => self.account_id = token.to_owned(),
            "interface-id" => self.interface_id = token.to_owned(),
            "srcaddr" => self.src_addr = token.to_owned(),
            "dstaddr" => self.dst_addr = token.to_owned(),
            "srcport" => self.src_port = token.to_owned(),
            "dstport" => self.dst_port = token.to_owned(),
            "protocol" => self.protocol = token.to_owned(),
            "packets" => self.packets = parse_integer(token),
            "bytes" => self.bytes = parse_integer(token),
            "start" => self.start = parse_integer(token),
            "end" => self.end = parse_integer(token),
            "action" => self.action = token.to_owned(),
            "log-status" => self.log_status = token.to_owned(),
            "vpc-id" => self.vpc_id = token.to_owned(),
            "subnet-id" => self.subnet_id = token.to_owned(),
            "instance-id" => self.instance_id = token.to_owned(),
            "tcp-flags" => self.tcp_flags = parse_integer(token),
            "type" => self.flow_type = token.to_owned(),
            "pkt-srcaddr" => self.pkt_srcaddr = token.to_owned(),
            "pkt-dstaddr" => self.pkt_dstaddr = token.to_owned(),
            "region" => self.region = token.to_owned(),
            "az-id" => self.az_id = token.to_owned(),
            "sublocation-type" => self.sublocation_type = token.to_owned(),
            "sublocation-id" => self.sublocation_id = token.to_owned(),
            "pkt-src-aws-service" => self.pkt_src_aws_service = token.to_owned(),
            "pkt-dst-aws-service" => self.pkt_dst_aws_service = token.to_owned(),
            "flow-direction" => self.flow_direction = token.to_owned(),
            "traffic-path" => self.traffic_path = parse_integer(token),
            "ecs-cluster-arn" => self.ecs_cluster_arn = token.to_owned(),
            "ecs-cluster-name" => self.ecs_cluster_name = token.to_owned(),
            "ecs-container-instance-arn" => {
                self.ecs_container_instance_arn = token.to_owned()
            }
            "ecs-container-instance-id" => self.ecs_container_instance_id = token.to_owned(),
            "ecs-container-id" => self.ecs_container_id = token.to_owned(),
            "ecs-second-container-id" => self.ecs_second_container_id = token.to_owned(),
            "ecs-service-name" => self.ecs_service_name = token.to_owned(),
            "ecs-task-definition-arn" => self.ecs_task_definition_arn = token.to_owned(),
            "ecs-task-arn" => self.ecs_task_arn = token.to_owned(),
            "ecs-task-id" => self.ecs_task_id = token.to_owned(),
            "reject-reason" => self.reject_reason = token.to_owned(),
            "resource-id" => self.resource_id = token.to_owned(),
            "encryption-status" => self.encryption_status = token.to_owned(),
            // Forward compatibility: fields this version does not know about
            // are ignored rather than failing the record.
            _ => {}
        }
    }

    /// All string-typed fields as (internal key, value) pairs, in field
    /// order. Used when inserting data point attributes.
    pub fn string_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("version", &self.version),
            ("account_id", &self.account_id),
            ("interface_id", &self.interface_id),
            ("src_addr", &self.src_addr),
            ("dst_addr", &self.dst_addr),
            ("src_port", &self.src_port),
            ("dst_port", &self.dst_port),
            ("protocol", &self.protocol),
            ("protocol_name", &self.protocol_name),
            ("action", &self.action),
            ("log_status", &self.log_status),
            ("vpc_id", &self.vpc_id),
            ("subnet_id", &self.subnet_id),
            ("instance_id", &self.instance_id),
            ("type", &self.flow_type),
            ("pkt_srcaddr", &self.pkt_srcaddr),
            ("pkt_dstaddr", &self.pkt_dstaddr),
            ("region", &self.region),
            ("az_id", &self.az_id),
            ("sublocation_type", &self.sublocation_type),
            ("sublocation_id", &self.sublocation_id),
            ("pkt_src_aws_service", &self.pkt_src_aws_service),
            ("pkt_dst_aws_service", &self.pkt_dst_aws_service),
            ("flow_direction", &self.flow_direction),
            ("ecs_cluster_arn", &self.ecs_cluster_arn),
            ("ecs_cluster_name", &self.ecs_cluster_name),
            ("ecs_container_instance_arn", &self.ecs_container_instance_arn),
            ("ecs_container_instance_id", &self.ecs_container_instance_id),
            ("ecs_container_id", &self.ecs_container_id),
            ("ecs_second_container_id", &self.ecs_second_container_id),
            ("ecs_service_name", &self.ecs_service_name),
            ("ecs_task_definition_arn", &self.ecs_task_definition_arn),
            ("ecs_task_arn", &self.ecs_task_arn),
            ("ecs_task_id", &self.ecs_task_id),
            ("reject_reason", &self.reject_reason),
            ("resource_id", &self.resource_id),
            ("encryption_status", &self.encryption_status),
        ]
    }

    /// Renders the record back into the default positional layout. Used by
    /// round-trip tests.
    pub fn render_default(&self) -> String {
        format!(
            "{} {} {} {} {} {} {} {} {} {} {} {} {} {}",
            self.version,
            self.account_id,
            self.interface_id,
            self.src_addr,
            self.dst_addr,
            self.src_port,
            self.dst_port,
            self.protocol,
            self.packets,
            self.bytes,
            self.start,
            self.end,
            self.action,
            self.log_status
        )
    }
}

/// Maps an internal snake_case field key to the provider's kebab-case field
/// name, as used in format strings and validation errors. A small whitelist
/// covers the names where a plain underscore-to-dash conversion would be
/// wrong; everything else converts mechanically.
pub fn provider_field_name(internal_key: &str) -> String {
    match internal_key {
        "src_addr" => "srcaddr".to_owned(),
        "dst_addr" => "dstaddr".to_owned(),
        "src_port" => "srcport".to_owned(),
        "dst_port" => "dstport".to_owned(),
        "log_status" => "log-status".to_owned(),
        "account_id" => "account-id".to_owned(),
        "interface_id" => "interface-id".to_owned(),
        // Computed field; it has no provider spelling, so it keeps its
        // camelCase name.
        "protocol_name" => "protocolName".to_owned(),
        other => other.replace('_', "-"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_field_names_are_skipped() {
        let mut record = FlowLogRecord::default();
        record.set_field("some-future-field", "whatever");
        assert_eq!(record, FlowLogRecord::default());
    }

    #[test]
    fn integer_fields_default_to_zero() {
        let mut record = FlowLogRecord::default();
        record.set_field("packets", "-");
        record.set_field("bytes", "not-a-number");
        record.set_field("start", "");
        assert_eq!(record.packets, 0);
        assert_eq!(record.bytes, 0);
        assert_eq!(record.start, 0);
    }

    #[test]
    fn provider_field_names() {
        assert_eq!(provider_field_name("src_addr"), "srcaddr");
        assert_eq!(provider_field_name("dst_port"), "dstport");
        assert_eq!(provider_field_name("log_status"), "log-status");
        assert_eq!(provider_field_name("account_id"), "account-id");
        assert_eq!(provider_field_name("interface_id"), "interface-id");
        assert_eq!(provider_field_name("protocol_name"), "protocolName");
        // Fallback conversion for everything else.
        assert_eq!(provider_field_name("vpc_id"), "vpc-id");
        assert_eq!(provider_field_name("pkt_src_aws_service"), "pkt-src-aws-service");
        assert_eq!(provider_field_name("version"), "version");
    }

    #[test]
    fn default_render_round_trips_field_order() {
        let mut record = FlowLogRecord::default();
        for (name, token) in [
            ("version", "2"),
            ("account-id", "123456789012"),
            ("interface-id", "eni-0a"),
            ("srcaddr", "10.0.0.1"),
            ("dstaddr", "10.0.0.2"),
            ("srcport", "443"),
            ("dstport", "49152"),
            ("protocol", "6"),
            ("packets", "25"),
            ("bytes", "4000"),
            ("start", "1620000000"),
            ("end", "1620000060"),
            ("action", "ACCEPT"),
            ("log-status", "OK"),
        ] {
            record.set_field(name, token);
        }
        assert_eq!(
            record.render_default(),
            "2 123456789012 eni-0a 10.0.0.1 10.0.0.2 443 49152 6 25 4000 1620000000 1620000060 ACCEPT OK"
        );
    }
}

use crate::aws_credentials::{self, basic_runtime};
use anyhow::{Context, Result};
use rusoto_core::Region;
use rusoto_ec2::{DescribeFlowLogsRequest, Ec2, Ec2Client, Filter};
use slog::{debug, o, Logger};
use tokio::runtime::Runtime;

/// The provider's answer to "what format do flow logs in this log group
/// use": the configured format string, the id of the flow log carrying it,
/// and how many flow logs point at the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatLookup {
    pub format: String,
    pub flow_log_id: String,
    pub flow_log_count: i64,
}

/// Retrieves flow log format strings from the provider API. The pipeline
/// only consults a source on a cache miss.
pub trait FlowLogFormatSource: Send + Sync {
    fn lookup(&self, log_group: &str) -> Result<FormatLookup>;
}

/// FlowLogFormatSource backed by the EC2 DescribeFlowLogs API.
pub struct DescribeFlowLogsFormatSource {
    client: Ec2Client,
    runtime: Runtime,
    logger: Logger,
}

impl DescribeFlowLogsFormatSource {
    #[cfg(test)]
    fn new_with_client(
        client: Ec2Client,
        parent_logger: &Logger,
    ) -> Result<DescribeFlowLogsFormatSource> {
        Ok(DescribeFlowLogsFormatSource {
            client,
            runtime: basic_runtime()?,
            logger: parent_logger.new(o!()),
        })
    }

    pub fn new(parent_logger: &Logger) -> Result<DescribeFlowLogsFormatSource> {
        let credentials = aws_credentials::DefaultCredentialsProvider::new()
            .context("failed to construct AWS credentials provider")?;
        let client = Ec2Client::new_with(
            aws_credentials::http_client().context("failed to construct EC2 HTTP client")?,
            credentials,
            Region::default(),
        );
        Ok(DescribeFlowLogsFormatSource {
            client,
            runtime: basic_runtime()?,
            logger: parent_logger.new(o!()),
        })
    }
}

impl FlowLogFormatSource for DescribeFlowLogsFormatSource {
    fn lookup(&self, log_group: &str) -> Result<FormatLookup> {
        let request = DescribeFlowLogsRequest {
            filter: Some(vec![Filter {
                name: Some("log-group-name".to_owned()),
                values: Some(vec![log_group.to_owned()]),
            }]),
            ..Default::default()
        };

        let response = aws_credentials::retry_request("describe flow logs", || {
            self.runtime
                .block_on(self.client.describe_flow_logs(request.clone()))
        })
        .context("DescribeFlowLogs failed")?;

        let flow_logs = response.flow_logs.unwrap_or_default();
        debug!(
            self.logger,
            "log group {} has {} flow log(s)",
            log_group,
            flow_logs.len()
        );

        // Several flow logs can point at the same group; they all share the
        // group's delivery format, so the first one's format suffices.
        let first = flow_logs.first();
        Ok(FormatLookup {
            format: first
                .and_then(|fl| fl.log_format.clone())
                .unwrap_or_default(),
            flow_log_id: first
                .and_then(|fl| fl.flow_log_id.clone())
                .unwrap_or_default(),
            flow_log_count: flow_logs.len() as i64,
        })
    }
}

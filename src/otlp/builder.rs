use crate::{
    classify::{parse_host, HostMatch},
    otlp::{
        logs::{LogRecord, LogsData, Resource, ResourceLogs, ScopeLogs},
        value::{AnyValue, KeyValue},
    },
    FORWARDER_ID,
};
use std::collections::BTreeMap;

/// Resource attribute keys managed by the builder.
const CLOUD_ACCOUNT_KEY: &str = "cloud.account.id";
const LOG_GROUP_KEY: &str = "aws.log.group";
const LOG_STREAM_KEY: &str = "aws.log.stream";
const HOST_ID_KEY: &str = "host.id";
const CLOUD_PLATFORM_KEY: &str = "cloud.platform";
const CLOUD_PLATFORM_EC2: &str = "aws-ec2";
const CLOUD_PROVIDER_KEY: &str = "cloud.provider";
const CLOUD_PROVIDER_AWS: &str = "aws";
const TELEMETRY_SDK_KEY: &str = "telemetry.sdk.name";
const HOST_NAME_KEY: &str = "host.name";
const SERVICE_NAME_KEY: &str = "service.name";
const REGION_KEY: &str = "region";

const K8S_POD_NAME_KEY: &str = "k8s.pod.name";
const K8S_NAMESPACE_KEY: &str = "k8s.namespace.name";
const K8S_POD_UID_KEY: &str = "k8s.pod.uid";
const K8S_CONTAINER_NAME_KEY: &str = "k8s.container.name";
const CONTAINER_IMAGE_KEY: &str = "container.image.name";
const CONTAINER_ID_KEY: &str = "container.id";
const K8S_CLUSTER_UID_KEY: &str = "sw.k8s.cluster.uid";
const K8S_MANIFEST_VERSION_KEY: &str = "sw.k8s.manifest.version";
const K8S_POD_LABEL_PREFIX: &str = "k8s.pod.labels.";
const K8S_POD_ANNOTATION_PREFIX: &str = "k8s.pod.annotations.";

/// The Kubernetes container identity a batch of application logs is
/// attributed to. A change in any component closes the open batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerIdentity {
    pub cluster_uid: String,
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
}

/// Accumulates log records under a single resource identity and renders them
/// as one OTLP resource/scope pair. The builder itself never ships anything;
/// the pipeline driver decides when to close it out with [`Self::build`] and
/// start a fresh one.
#[derive(Debug, Clone)]
pub struct LogsRequestBuilder {
    resource_attributes: Vec<KeyValue>,
    records: Vec<LogRecord>,
    host_id: Option<String>,
    container: Option<ContainerIdentity>,
    stream_host: Option<HostMatch>,
}

impl LogsRequestBuilder {
    pub fn new() -> LogsRequestBuilder {
        LogsRequestBuilder {
            resource_attributes: Vec::new(),
            records: Vec::new(),
            host_id: None,
            container: None,
            stream_host: None,
        }
    }

    /// Inserts or replaces a resource attribute, preserving first-insertion
    /// order.
    fn upsert_attribute(&mut self, key: &str, value: AnyValue) {
        match self
            .resource_attributes
            .iter_mut()
            .find(|attr| attr.key == key)
        {
            Some(existing) => existing.value = value,
            None => self.resource_attributes.push(KeyValue {
                key: key.to_owned(),
                value,
            }),
        }
    }

    fn remove_attribute(&mut self, key: &str) {
        self.resource_attributes.retain(|attr| attr.key != key);
    }

    fn upsert_string(&mut self, key: &str, value: &str) {
        self.upsert_attribute(key, AnyValue::StringValue(value.to_owned()));
    }

    pub fn set_cloud_account(&mut self, account: &str) -> &mut Self {
        self.upsert_string(CLOUD_ACCOUNT_KEY, account);
        self
    }

    pub fn set_log_group(&mut self, log_group: &str) -> &mut Self {
        self.upsert_string(LOG_GROUP_KEY, log_group);
        self
    }

    /// Records the log stream and sniffs instance identity out of its name.
    /// When the stream name looks like an EC2 host name and no host id has
    /// been attributed yet, the parsed instance becomes the host id.
    pub fn set_log_stream(&mut self, log_stream: &str) -> &mut Self {
        self.upsert_string(LOG_STREAM_KEY, log_stream);
        self.stream_host = parse_host(log_stream);
        if self.host_id.is_none() {
            if let Some(instance_id) = self
                .stream_host
                .as_ref()
                .map(|h| h.instance_id.clone())
                .filter(|id| !id.is_empty())
            {
                self.set_host_id(&instance_id);
            }
        }
        self
    }

    /// Attributes the open batch to an EC2 instance. A non-empty id sets
    /// `host.id` and marks the platform as EC2; an empty id clears both.
    pub fn set_host_id(&mut self, host_id: &str) -> &mut Self {
        if host_id.is_empty() {
            self.remove_attribute(HOST_ID_KEY);
            self.remove_attribute(CLOUD_PLATFORM_KEY);
            self.host_id = None;
        } else {
            self.upsert_string(HOST_ID_KEY, host_id);
            self.upsert_string(CLOUD_PLATFORM_KEY, CLOUD_PLATFORM_EC2);
            self.host_id = Some(host_id.to_owned());
        }
        self
    }

    pub fn set_kubernetes_pod_name(&mut self, pod_name: &str) -> &mut Self {
        self.upsert_string(K8S_POD_NAME_KEY, pod_name);
        self
    }

    pub fn set_kubernetes_namespace(&mut self, namespace: &str) -> &mut Self {
        self.upsert_string(K8S_NAMESPACE_KEY, namespace);
        self
    }

    pub fn set_kubernetes_pod_id(&mut self, pod_id: &str) -> &mut Self {
        self.upsert_string(K8S_POD_UID_KEY, pod_id);
        self
    }

    pub fn set_kubernetes_container_name(&mut self, container_name: &str) -> &mut Self {
        self.upsert_string(K8S_CONTAINER_NAME_KEY, container_name);
        self
    }

    pub fn set_kubernetes_container_image(&mut self, image: &str) -> &mut Self {
        self.upsert_string(CONTAINER_IMAGE_KEY, image);
        self
    }

    pub fn set_kubernetes_docker_id(&mut self, docker_id: &str) -> &mut Self {
        self.upsert_string(CONTAINER_ID_KEY, docker_id);
        self
    }

    pub fn set_kubernetes_cluster_uid(&mut self, cluster_uid: &str) -> &mut Self {
        self.upsert_string(K8S_CLUSTER_UID_KEY, cluster_uid);
        self
    }

    /// Sets the manifest version attribute, falling back to the supplied
    /// default when the record carried none.
    pub fn set_kubernetes_manifest_version(&mut self, version: &str, default: &str) -> &mut Self {
        let effective = if version.is_empty() { default } else { version };
        self.upsert_string(K8S_MANIFEST_VERSION_KEY, effective);
        self
    }

    /// Flattens pod labels into `k8s.pod.labels.<key>` attributes.
    pub fn set_kubernetes_labels(&mut self, labels: &BTreeMap<String, String>) -> &mut Self {
        for (key, value) in labels {
            let attribute_key = format!("{K8S_POD_LABEL_PREFIX}{key}");
            self.upsert_string(&attribute_key, value);
        }
        self
    }

    /// Flattens pod annotations into `k8s.pod.annotations.<key>` attributes.
    pub fn set_kubernetes_annotations(
        &mut self,
        annotations: &BTreeMap<String, String>,
    ) -> &mut Self {
        for (key, value) in annotations {
            let attribute_key = format!("{K8S_POD_ANNOTATION_PREFIX}{key}");
            self.upsert_string(&attribute_key, value);
        }
        self
    }

    /// Sets `host.name` to the pod name and `service.name` to the container
    /// name, the identities downstream indexing keys on.
    pub fn set_otel_attributes(&mut self, pod_name: &str, container_name: &str) -> &mut Self {
        self.upsert_string(HOST_NAME_KEY, pod_name);
        self.upsert_string(SERVICE_NAME_KEY, container_name);
        self
    }

    /// Remembers the container identity the current batch belongs to.
    pub fn set_container_identity(&mut self, identity: ContainerIdentity) -> &mut Self {
        self.container = Some(identity);
        self
    }

    pub fn has_host_id(&self) -> bool {
        self.host_id.is_some()
    }

    pub fn match_host_id(&self, host_id: &str) -> bool {
        self.host_id.as_deref() == Some(host_id)
    }

    pub fn has_container_identity(&self) -> bool {
        self.container.is_some()
    }

    pub fn match_container_identity(&self, identity: &ContainerIdentity) -> bool {
        self.container.as_ref() == Some(identity)
    }

    /// The instance id parsed from the log stream name, if the stream name
    /// looked like an EC2 host name.
    pub fn stream_instance_id(&self) -> Option<&str> {
        self.stream_host
            .as_ref()
            .map(|h| h.instance_id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// The region parsed from the log stream name, if any.
    pub fn stream_region(&self) -> Option<&str> {
        self.stream_host
            .as_ref()
            .map(|h| h.region.as_str())
            .filter(|region| !region.is_empty())
    }

    /// Appends one log record under the current resource identity. The
    /// region attribute is taken from the record when present, otherwise
    /// from the region previously parsed out of the stream name.
    pub fn add_log_entry(
        &mut self,
        time_unix_nano: u64,
        body: AnyValue,
        region: &str,
        extra_attributes: Vec<KeyValue>,
    ) -> &mut Self {
        let mut attributes = Vec::with_capacity(1 + extra_attributes.len());

        let effective_region = if region.is_empty() {
            self.stream_host
                .as_ref()
                .map(|h| h.region.as_str())
                .unwrap_or("")
        } else {
            region
        };
        if !effective_region.is_empty() {
            attributes.push(KeyValue::string(REGION_KEY, effective_region));
        }
        attributes.extend(extra_attributes);

        let mut record = LogRecord::new(time_unix_nano, body);
        record.attributes = attributes;
        self.records.push(record);
        self
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Closes out the builder, rendering everything accumulated so far as a
    /// single resource wrapping a single scope. The provider and forwarder
    /// identity are stamped on every payload.
    pub fn build(mut self) -> LogsData {
        self.upsert_string(CLOUD_PROVIDER_KEY, CLOUD_PROVIDER_AWS);
        self.upsert_string(TELEMETRY_SDK_KEY, FORWARDER_ID);

        LogsData {
            resource_logs: vec![ResourceLogs {
                resource: Resource {
                    attributes: self.resource_attributes,
                },
                scope_logs: vec![ScopeLogs {
                    log_records: self.records,
                }],
            }],
        }
    }
}

impl Default for LogsRequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

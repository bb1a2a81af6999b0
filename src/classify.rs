use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

/// Matches EC2-style host names such as
/// `ip-192-168-1-1.us-east-2.compute.internal` or
/// `fargate-ip-10-0-1-2.eu-west-1.compute.internal`, capturing the optional
/// fargate prefix, the instance portion and the region.
static HOST_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<fargate>fargate-)?(?P<instance>(i-|ip-)[\w\-]+)\.(?P<region>[\w-]+)\.")
        .unwrap()
});

/// The outcome of matching a host or node name against [`HOST_PATTERN`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMatch {
    /// The instance portion of the name. Empty when the name carried the
    /// fargate prefix, because fargate tasks have no backing instance.
    pub instance_id: String,
    pub region: String,
    pub fargate: bool,
}

/// Parses instance identity and region out of an EC2-style host name.
/// Returns None when the name does not look like one.
pub fn parse_host(host: &str) -> Option<HostMatch> {
    let captures = HOST_PATTERN.captures(host)?;
    let fargate = captures.name("fargate").is_some();
    let instance_id = if fargate {
        String::new()
    } else {
        captures
            .name("instance")
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default()
    };
    let region = captures
        .name("region")
        .map(|m| m.as_str().to_owned())
        .unwrap_or_default();
    Some(HostMatch {
        instance_id,
        region,
        fargate,
    })
}

/// Kubernetes identity and context carried by Fargate and pod application
/// logs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KubernetesContext {
    pub host: String,
    pub pod_name: String,
    pub namespace_name: String,
    pub pod_id: String,
    pub container_name: String,
    pub container_image: String,
    pub docker_id: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// An application log line emitted by a pod, along with its Kubernetes
/// context and cluster identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLogEvent {
    pub kubernetes: KubernetesContext,
    pub cluster_uid: String,
    pub log_type: String,
    pub manifest_version: String,
    pub stream: String,
    pub log: String,
    /// Identity parsed from `kubernetes.host`.
    pub host: Option<HostMatch>,
}

impl AppLogEvent {
    /// Whether this record came from a Fargate task (no backing instance).
    pub fn is_fargate(&self) -> bool {
        self.host.as_ref().map(|h| h.fargate).unwrap_or(false)
    }
}

/// A raw log message classified into one of the known record shapes.
/// Classification is total: anything that does not match a known shape is
/// `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedEvent {
    /// A cloud-audit event from the EC2 service carrying instance identity.
    Ec2Audit {
        instance_id: String,
        region: String,
    },
    /// Any other cloud-audit event.
    GenericAudit { region: String },
    /// A Container Insights application log tied to an EC2 node.
    ClusterInsightsLog {
        instance_id: String,
        region: String,
    },
    /// An application log from a pod or Fargate task.
    AppLog(Box<AppLogEvent>),
    /// A Container Insights performance record.
    ClusterInsightsPerformance {
        instance_id: String,
        region: String,
    },
    Unknown,
}

impl ClassifiedEvent {
    /// The instance identity this record should be attributed to, if any.
    pub fn host_identity(&self) -> Option<&str> {
        let id = match self {
            ClassifiedEvent::Ec2Audit { instance_id, .. } => instance_id,
            ClassifiedEvent::ClusterInsightsLog { instance_id, .. } => instance_id,
            ClassifiedEvent::ClusterInsightsPerformance { instance_id, .. } => instance_id,
            ClassifiedEvent::AppLog(app) => {
                return app
                    .host
                    .as_ref()
                    .map(|h| h.instance_id.as_str())
                    .filter(|id| !id.is_empty())
            }
            _ => return None,
        };
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }

    /// The region this record carries, if any.
    pub fn region(&self) -> Option<&str> {
        let region = match self {
            ClassifiedEvent::Ec2Audit { region, .. } => region,
            ClassifiedEvent::GenericAudit { region } => region,
            ClassifiedEvent::ClusterInsightsLog { region, .. } => region,
            ClassifiedEvent::ClusterInsightsPerformance { region, .. } => region,
            ClassifiedEvent::AppLog(app) => return app.host.as_ref().map(|h| h.region.as_str()),
            ClassifiedEvent::Unknown => return None,
        };
        if region.is_empty() {
            None
        } else {
            Some(region)
        }
    }
}

/// Classifies a raw log message into one of the known record shapes.
///
/// The message is parsed as JSON and matched by path presence, first match
/// wins, in the order: EC2 audit, generic audit, cluster insights log,
/// pod/Fargate application log, cluster insights performance. Substring
/// heuristics are never used. Anything unparseable or unmatched is
/// `Unknown`.
pub fn classify(raw_message: &str) -> ClassifiedEvent {
    let value: Value = match serde_json::from_str(raw_message) {
        Ok(Value::Object(map)) => Value::Object(map),
        _ => return ClassifiedEvent::Unknown,
    };

    if value.get("eventSource").and_then(Value::as_str) == Some("ec2.amazonaws.com")
        && (value.pointer("/requestParameters/instancesSet").is_some()
            || value.pointer("/responseElements/instancesSet").is_some())
    {
        return classify_ec2_audit(&value);
    }

    if value.get("eventVersion").is_some() {
        return ClassifiedEvent::GenericAudit {
            region: string_at(&value, "/awsRegion"),
        };
    }

    if value.get("ec2_instance_id").is_some() {
        return ClassifiedEvent::ClusterInsightsLog {
            instance_id: string_at(&value, "/ec2_instance_id"),
            region: region_from_availability_zone(&string_at(&value, "/az")),
        };
    }

    if value.pointer("/kubernetes/host").is_some()
        && value.pointer("/kubernetes/namespace_name").is_some()
    {
        return classify_app_log(&value);
    }

    if value.get("InstanceId").is_some() && value.get("AutoScalingGroupName").is_some() {
        let node_name = string_at(&value, "/NodeName");
        let region = parse_host(&node_name)
            .map(|h| h.region)
            .unwrap_or_default();
        return ClassifiedEvent::ClusterInsightsPerformance {
            instance_id: string_at(&value, "/InstanceId"),
            region,
        };
    }

    ClassifiedEvent::Unknown
}

fn classify_ec2_audit(value: &Value) -> ClassifiedEvent {
    // The instance the event is about is the first non-empty instanceId,
    // scanning request items before response items.
    let instance_id = ["/requestParameters/instancesSet/items", "/responseElements/instancesSet/items"]
        .into_iter()
        .filter_map(|path| value.pointer(path))
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(|item| item.get("instanceId"))
        .filter_map(Value::as_str)
        .find(|id| !id.is_empty())
        .unwrap_or_default()
        .to_owned();

    ClassifiedEvent::Ec2Audit {
        instance_id,
        region: string_at(value, "/awsRegion"),
    }
}

fn classify_app_log(value: &Value) -> ClassifiedEvent {
    let kubernetes = KubernetesContext {
        host: string_at(value, "/kubernetes/host"),
        pod_name: string_at(value, "/kubernetes/pod_name"),
        namespace_name: string_at(value, "/kubernetes/namespace_name"),
        pod_id: string_at(value, "/kubernetes/pod_id"),
        container_name: string_at(value, "/kubernetes/container_name"),
        container_image: string_at(value, "/kubernetes/container_image"),
        docker_id: string_at(value, "/kubernetes/docker_id"),
        labels: string_map_at(value, "/kubernetes/labels"),
        annotations: string_map_at(value, "/kubernetes/annotations"),
    };
    let host = parse_host(&kubernetes.host);

    ClassifiedEvent::AppLog(Box::new(AppLogEvent {
        cluster_uid: string_at(value, "/cluster/uid"),
        log_type: flat_string(value, "log.type"),
        manifest_version: flat_string(value, "manifest.version"),
        stream: string_at(value, "/stream"),
        log: string_at(value, "/log"),
        kubernetes,
        host,
    }))
}

fn string_at(value: &Value, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

/// Fetches a top-level key whose name itself contains a dot, which a JSON
/// pointer would misread as nesting.
fn flat_string(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

fn string_map_at(value: &Value, pointer: &str) -> BTreeMap<String, String> {
    value
        .pointer(pointer)
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect()
        })
        .unwrap_or_default()
}

/// Availability zones end in a zone letter appended to the region name:
/// `us-east-1a` is zone `a` of `us-east-1`.
fn region_from_availability_zone(az: &str) -> String {
    az.trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .to_owned()
}

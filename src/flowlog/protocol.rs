use once_cell::sync::Lazy;
use std::collections::HashMap;

/// IANA protocol numbers this forwarder translates to canonical names.
/// Anything else passes through unchanged, so numeric values for exotic
/// protocols still land as attributes.
static PROTOCOL_NAMES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("1", "ICMP"),
        ("6", "TCP"),
        ("17", "UDP"),
        ("47", "GRE"),
        ("50", "ESP"),
        ("51", "AH"),
        ("58", "ICMPv6"),
        ("89", "OSPF"),
        ("132", "SCTP"),
    ])
});

/// Translates a numeric protocol token into its canonical name. Unknown
/// values pass through; empty input maps to empty.
pub fn protocol_name(protocol: &str) -> String {
    if protocol.is_empty() {
        return String::new();
    }
    PROTOCOL_NAMES
        .get(protocol)
        .map(|name| (*name).to_owned())
        .unwrap_or_else(|| protocol.to_owned())
}

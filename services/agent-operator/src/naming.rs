//! Deterministic resource names.
//!
//! Every name the operator creates is a pure function of an Agent's name or
//! class, so repeated reconciliations always address the same objects.

/// Namespace dedicated to a workload class.
pub fn class_namespace(agent_type: &str) -> String {
    format!("agent-{agent_type}")
}

/// Name of the pod backing an Agent.
pub fn pod_name(agent_name: &str) -> String {
    format!("agent-{agent_name}")
}

/// Role/user name for a class in both datastores.
///
/// Separator characters are stripped because the stores reject or mangle
/// them in identifiers.
pub fn store_username(agent_type: &str) -> String {
    let stripped: String = agent_type
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .collect();
    format!("agent_{stripped}")
}

/// Dedicated relational schema for a class: anything outside
/// `[A-Za-z0-9_]` becomes `_`.
pub fn schema_name(agent_type: &str) -> String {
    agent_type
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Key patterns a class's cache-store user may read and write.
pub fn key_patterns(agent_type: &str) -> Vec<String> {
    vec![format!("agent:{agent_type}:*"), "system:*".to_string()]
}

/// Stream an agent consumes requests from.
pub fn inbox_stream(agent_name: &str) -> String {
    format!("agent:{agent_name}:inbox")
}

/// Stream an agent publishes replies to.
pub fn reply_stream(agent_name: &str) -> String {
    format!("agent:{agent_name}:reply")
}

/// Fully-qualified in-cluster DNS name of a service.
pub fn service_fqdn(service: &str, namespace: &str) -> String {
    format!("{service}.{namespace}.svc.cluster.local")
}

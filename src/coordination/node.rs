/// Derive a stable-ish node identifier.
///
/// Prefers the `LEASEGATE_NODE_ID` environment variable.  Falls back to
/// `<hostname>-<random-8-chars>` so that every process gets a unique id even
/// on the same host.  The id is recorded in lease values and scopes this
/// process's message-deduplication markers.
pub fn node_id() -> String {
    std::env::var("LEASEGATE_NODE_ID")
        .ok()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(generated_node_id)
}

fn generated_node_id() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
    format!("{hostname}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_per_process_instance() {
        let a = generated_node_id();
        let b = generated_node_id();
        assert_ne!(a, b);
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        assert!(a.starts_with(&format!("{hostname}-")));
    }
}

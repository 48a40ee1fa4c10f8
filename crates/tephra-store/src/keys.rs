//! Storage key construction.
//!
//! All object keys the engine reads or writes are built here so the layout
//! stays in one place.

/// Key prefix under which a dataset's fragments live.
#[must_use]
pub fn fragment_prefix(dataset_id: &str) -> String {
    format!("datasets/{dataset_id}/fragments/")
}

/// Key for a fragment object.
#[must_use]
pub fn fragment_key(dataset_id: &str, fragment_id: &str) -> String {
    format!("datasets/{dataset_id}/fragments/{fragment_id}.tph")
}

/// Key for an archived event-log container file.
#[must_use]
pub fn container_key(dataset_id: &str, file_id: &str) -> String {
    format!("datasets/{dataset_id}/log/{file_id}.evl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_keys_live_under_their_prefix() {
        let key = fragment_key("metrics", "01ABC");
        assert!(key.starts_with(&fragment_prefix("metrics")));
        assert_eq!(key, "datasets/metrics/fragments/01ABC.tph");
    }

    #[test]
    fn container_keys_are_separate_from_fragments() {
        let key = container_key("metrics", "f42");
        assert_eq!(key, "datasets/metrics/log/f42.evl");
        assert!(!key.starts_with(&fragment_prefix("metrics")));
    }
}

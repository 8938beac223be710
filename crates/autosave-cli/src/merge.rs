use std::sync::Arc;

use autosave_core::{ConflictResolver, Record};

use crate::config::MergeStrategy;

/// Resolver for `strategy`, or `None` when conflicts are left to the user.
pub fn resolver_for(strategy: MergeStrategy) -> Option<Arc<dyn ConflictResolver>> {
    match strategy {
        MergeStrategy::Manual => None,
        MergeStrategy::Shallow => Some(Arc::new(shallow_merge)),
        MergeStrategy::Local => Some(Arc::new(|local: &Record, _remote: &Record| local.clone())),
    }
}

/// Remote record with the local top-level fields laid over it.
///
/// Non-object records cannot be merged field by field; the local one wins.
pub fn shallow_merge(local: &Record, remote: &Record) -> Record {
    match (local.as_object(), remote.as_object()) {
        (Some(local_fields), Some(remote_fields)) => {
            let mut merged = remote_fields.clone();
            for (name, value) in local_fields {
                merged.insert(name.clone(), value.clone());
            }
            Record::Object(merged)
        }
        _ => local.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shallow_merge_keeps_remote_only_fields() {
        let local = json!({"title": "Mine", "body": "text"});
        let remote = json!({"title": "Theirs", "tags": ["a"]});

        assert_eq!(
            shallow_merge(&local, &remote),
            json!({"title": "Mine", "body": "text", "tags": ["a"]})
        );
    }

    #[test]
    fn test_shallow_merge_non_objects() {
        assert_eq!(shallow_merge(&json!([1]), &json!({"a": 1})), json!([1]));
    }

    #[test]
    fn test_manual_has_no_resolver() {
        assert!(resolver_for(MergeStrategy::Manual).is_none());
        assert!(resolver_for(MergeStrategy::Shallow).is_some());
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Record;

/// Local and remote copies of a record that diverged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCase {
    /// What this session tried to save
    pub local_data: Record,
    /// What the remote store currently holds
    pub remote_data: Record,
    /// Version of `remote_data`. A merged save expects this version.
    pub remote_version: Option<String>,
}

/// Merges diverged local and remote copies into one record.
///
/// Need not be pure or deterministic, but must return a record.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, local: &Record, remote: &Record) -> Record;
}

#[async_trait]
impl<F> ConflictResolver for F
where
    F: Fn(&Record, &Record) -> Record + Send + Sync,
{
    async fn resolve(&self, local: &Record, remote: &Record) -> Record {
        self(local, remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_closure_resolver() {
        let prefer_local_fields = |local: &Record, remote: &Record| {
            let mut merged = remote.clone();
            if let (Some(target), Some(source)) = (merged.as_object_mut(), local.as_object()) {
                for (k, v) in source {
                    target.insert(k.clone(), v.clone());
                }
            }
            merged
        };

        let merged = prefer_local_fields
            .resolve(&json!({"title": "mine"}), &json!({"title": "theirs", "tags": ["a"]}))
            .await;
        assert_eq!(merged, json!({"title": "mine", "tags": ["a"]}));
    }
}

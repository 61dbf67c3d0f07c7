//! Remote document store contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tally_core::RemoteError;

use crate::query::Query;

/// A document returned by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: serde_json::Value,
}

impl Document {
    pub fn new(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self { id: id.into(), data }
    }

    /// Field value, or `None` when absent or the data is not an object.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.data.get(name)
    }
}

/// The billed source of truth behind the cache.
///
/// Every document returned counts as one billed read.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch documents by id. Ids that do not exist are omitted from the result.
    async fn fetch_documents(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<Vec<Document>, RemoteError>;

    /// Run a query and return the matching documents.
    async fn run_query(&self, query: &Query) -> Result<Vec<Document>, RemoteError>;

    /// Whether the store can evaluate a query that combines an `in` predicate
    /// with other filters.
    fn supports_compound_predicates(&self) -> bool {
        true
    }
}

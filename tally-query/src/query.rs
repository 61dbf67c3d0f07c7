//! Query model and query merging
//!
//! A [`Query`] is a conjunction of field filters on one collection with an
//! optional ordering and limit. The optimizer uses three things from here:
//!
//! - [`Query::fingerprint`] for deterministic cache keys,
//! - [`Query::matches`] to split a merged result back per original query,
//! - [`plan_consolidation`] to fold queries that differ only by one equality
//!   value into `in` queries.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::remote::Document;

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Field equals one of the values of an array.
    In,
    /// Field is an array containing the value.
    ArrayContains,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "==",
            FilterOp::Ne => "!=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::In => " in ",
            FilterOp::ArrayContains => " array-contains ",
        }
    }
}

/// One `field op value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// Evaluate against a document. A missing field never matches.
    pub fn matches(&self, doc: &Document) -> bool {
        let Some(actual) = doc.field(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            FilterOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|values| values.contains(actual)),
            FilterOp::ArrayContains => actual
                .as_array()
                .is_some_and(|values| values.contains(&self.value)),
        }
    }

    fn sort_key(&self) -> (String, FilterOp, String) {
        (self.field.clone(), self.op, self.value.to_string())
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.field, self.op.as_str(), self.value)
    }
}

/// Numbers compare numerically, strings lexically; anything else is unordered.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Ordering clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

/// A query over one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    /// Every document of a collection.
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(
        mut self,
        field: impl Into<String>,
        op: FilterOp,
        value: impl Into<Value>,
    ) -> Self {
        self.filters.push(Filter::new(field, op, value));
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document satisfies every filter. Ordering and limit are ignored.
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Deterministic text form independent of filter order, used in cache keys.
    pub fn fingerprint(&self) -> String {
        let mut filters: Vec<&Filter> = self.filters.iter().collect();
        filters.sort_by_key(|f| f.sort_key());

        let mut parts: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
        if let Some(order) = &self.order_by {
            let dir = match order.direction {
                SortDirection::Ascending => "asc",
                SortDirection::Descending => "desc",
            };
            parts.push(format!("order={}:{}", order.field, dir));
        }
        if let Some(limit) = self.limit {
            parts.push(format!("limit={limit}"));
        }
        if parts.is_empty() {
            "all".to_string()
        } else {
            parts.join("&")
        }
    }

    /// Filters other than the given equality on `field`, sorted.
    fn filters_except_eq(&self, field: &str) -> Option<(Vec<Filter>, &Value)> {
        let mut eq_value = None;
        let mut rest = Vec::with_capacity(self.filters.len());
        for filter in &self.filters {
            if filter.field == field {
                if filter.op != FilterOp::Eq || eq_value.is_some() || !is_scalar(&filter.value) {
                    return None;
                }
                eq_value = Some(&filter.value);
            } else {
                rest.push(filter.clone());
            }
        }
        rest.sort_by_key(|f| f.sort_key());
        eq_value.map(|v| (rest, v))
    }
}

// ============================================================================
// CONSOLIDATION
// ============================================================================

/// How a set of queries folds into fewer `in` queries.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    /// Field whose equality values were merged.
    pub field: String,
    /// Queries to send to the store.
    pub merged: Vec<Query>,
    /// For each merged query, the indices of the original queries it answers.
    pub members: Vec<Vec<usize>>,
}

impl MergePlan {
    /// Remote calls saved over running every query separately.
    pub fn calls_saved(&self) -> usize {
        let originals: usize = self.members.iter().map(Vec::len).sum();
        originals.saturating_sub(self.merged.len())
    }
}

/// Plan merging `queries` into `in` queries of at most `max_in_values` values.
///
/// Queries merge when they target the same collection, share ordering, have
/// no limit, and differ only by the value of one equality filter. Shared
/// filters besides that equality are kept on the merged query and need
/// `allow_extra_filters`. Returns `None` when nothing would be saved.
pub fn plan_consolidation(
    queries: &[Query],
    max_in_values: usize,
    allow_extra_filters: bool,
) -> Option<MergePlan> {
    let first = queries.first()?;
    if queries.len() < 2 || max_in_values == 0 {
        return None;
    }
    let compatible = queries.iter().all(|q| {
        q.collection == first.collection && q.order_by == first.order_by && q.limit.is_none()
    });
    if !compatible {
        return None;
    }

    let candidates = first
        .filters
        .iter()
        .filter(|f| f.op == FilterOp::Eq)
        .map(|f| f.field.as_str());

    for field in candidates {
        let Some((shared, _)) = first.filters_except_eq(field) else {
            continue;
        };
        if !shared.is_empty() && !allow_extra_filters {
            continue;
        }

        let mut values: Vec<Value> = Vec::new();
        let mut value_index: Vec<usize> = Vec::with_capacity(queries.len());
        let all_match = queries.iter().all(|q| match q.filters_except_eq(field) {
            Some((rest, value)) if rest == shared => {
                let idx = match values.iter().position(|v| v == value) {
                    Some(idx) => idx,
                    None => {
                        values.push(value.clone());
                        values.len() - 1
                    }
                };
                value_index.push(idx);
                true
            }
            _ => false,
        });
        if !all_match {
            continue;
        }

        let mut merged = Vec::new();
        let mut members = Vec::new();
        for (chunk_no, chunk) in values.chunks(max_in_values).enumerate() {
            let mut filters = shared.clone();
            filters.push(Filter::new(field, FilterOp::In, Value::Array(chunk.to_vec())));
            merged.push(Query {
                collection: first.collection.clone(),
                filters,
                order_by: first.order_by.clone(),
                limit: None,
            });

            let lo = chunk_no * max_in_values;
            let hi = lo + chunk.len();
            members.push(
                value_index
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| (lo..hi).contains(*v))
                    .map(|(i, _)| i)
                    .collect(),
            );
        }

        let plan = MergePlan {
            field: field.to_string(),
            merged,
            members,
        };
        if plan.calls_saved() == 0 {
            return None;
        }
        return Some(plan);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chapter(id: &str, novel: &str, published: bool, number: i64) -> Document {
        Document::new(
            id,
            json!({
                "novelId": novel,
                "published": published,
                "number": number,
                "tags": ["drama"],
            }),
        )
    }

    fn chapters_of(novel: &str) -> Query {
        Query::collection("chapters")
            .where_eq("novelId", novel)
            .where_eq("published", true)
    }

    #[test]
    fn test_filter_operators() {
        let doc = chapter("c1", "n1", true, 5);
        assert!(Filter::eq("novelId", "n1").matches(&doc));
        assert!(Filter::new("number", FilterOp::Gt, 4).matches(&doc));
        assert!(Filter::new("number", FilterOp::Lte, 5).matches(&doc));
        assert!(!Filter::new("number", FilterOp::Lt, 5).matches(&doc));
        assert!(Filter::new("novelId", FilterOp::In, json!(["n0", "n1"])).matches(&doc));
        assert!(Filter::new("tags", FilterOp::ArrayContains, "drama").matches(&doc));
        assert!(!Filter::new("missing", FilterOp::Ne, 1).matches(&doc));
        assert!(!Filter::new("novelId", FilterOp::Gt, 1).matches(&doc));
    }

    #[test]
    fn test_fingerprint_ignores_filter_order() {
        let a = Query::collection("novels")
            .where_eq("status", "ongoing")
            .where_eq("genre", "fantasy");
        let b = Query::collection("novels")
            .where_eq("genre", "fantasy")
            .where_eq("status", "ongoing");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), a.clone().limit(20).fingerprint());
        assert_eq!(Query::collection("novels").fingerprint(), "all");
    }

    #[test]
    fn test_plan_merges_on_differing_equality() {
        let queries = vec![chapters_of("n1"), chapters_of("n2"), chapters_of("n3")];
        let plan = plan_consolidation(&queries, 10, true).unwrap();

        assert_eq!(plan.field, "novelId");
        assert_eq!(plan.merged.len(), 1);
        assert_eq!(plan.members, vec![vec![0, 1, 2]]);
        assert_eq!(plan.calls_saved(), 2);

        let merged = &plan.merged[0];
        assert!(merged.matches(&chapter("c", "n2", true, 1)));
        assert!(!merged.matches(&chapter("c", "n2", false, 1)));
        assert!(!merged.matches(&chapter("c", "n9", true, 1)));
    }

    #[test]
    fn test_plan_respects_in_value_cap() {
        let queries: Vec<Query> = (0..12).map(|i| chapters_of(&format!("n{i}"))).collect();
        let plan = plan_consolidation(&queries, 10, true).unwrap();
        assert_eq!(plan.merged.len(), 2);
        assert_eq!(plan.members[0].len(), 10);
        assert_eq!(plan.members[1], vec![10, 11]);
    }

    #[test]
    fn test_duplicate_values_share_a_slot() {
        let queries = vec![chapters_of("n1"), chapters_of("n1"), chapters_of("n2")];
        let plan = plan_consolidation(&queries, 10, true).unwrap();
        assert_eq!(plan.merged[0].filters.last().unwrap().value, json!(["n1", "n2"]));
        assert_eq!(plan.members, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_extra_filters_need_composite_indexes() {
        let queries = vec![chapters_of("n1"), chapters_of("n2")];
        assert!(plan_consolidation(&queries, 10, false).is_none());

        let bare = vec![
            Query::collection("novels").where_eq("authorId", "a1"),
            Query::collection("novels").where_eq("authorId", "a2"),
        ];
        assert!(plan_consolidation(&bare, 10, false).is_some());
    }

    #[test]
    fn test_incompatible_queries_do_not_merge() {
        let limited = vec![chapters_of("n1").limit(5), chapters_of("n2").limit(5)];
        assert!(plan_consolidation(&limited, 10, true).is_none());

        let mixed = vec![chapters_of("n1"), Query::collection("novels").where_eq("novelId", "n2")];
        assert!(plan_consolidation(&mixed, 10, true).is_none());

        let different_rest = vec![
            chapters_of("n1"),
            Query::collection("chapters")
                .where_eq("novelId", "n2")
                .where_eq("published", false),
        ];
        assert!(plan_consolidation(&different_rest, 10, true).is_none());

        assert!(plan_consolidation(&[chapters_of("n1")], 10, true).is_none());
    }

    #[test]
    fn test_no_plan_when_nothing_saved() {
        let queries = vec![chapters_of("n1"), chapters_of("n2")];
        assert!(plan_consolidation(&queries, 1, true).is_none());
    }

    proptest::proptest! {
        #[test]
        fn prop_plan_covers_every_query_once(
            novels in proptest::collection::vec("n[0-5]", 2..30),
            cap in 1usize..10,
        ) {
            let queries: Vec<Query> = novels.iter().map(|n| chapters_of(n)).collect();
            if let Some(plan) = plan_consolidation(&queries, cap, true) {
                let mut seen: Vec<usize> = plan.members.iter().flatten().copied().collect();
                seen.sort_unstable();
                proptest::prop_assert_eq!(seen, (0..queries.len()).collect::<Vec<_>>());
                proptest::prop_assert!(plan.merged.len() < queries.len());

                for merged in &plan.merged {
                    let values = merged
                        .filters
                        .iter()
                        .find(|f| f.op == FilterOp::In)
                        .and_then(|f| f.value.as_array())
                        .map(Vec::len);
                    proptest::prop_assert!(matches!(values, Some(n) if n <= cap));
                }
            }
        }
    }
}

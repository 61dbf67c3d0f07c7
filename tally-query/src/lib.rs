//! Tally Query - read facade over a remote document store
//!
//! Batches document reads, consolidates compatible queries and serves what
//! it can from the Tally cache so fewer billed reads reach the store.

pub mod optimizer;
pub mod query;
pub mod remote;

pub use optimizer::{
    OptimizerMetrics, OptimizerSnapshot, QueryOptimizer, ReadOutcome, ReadRequest, ReadTarget,
};
pub use query::{plan_consolidation, Filter, FilterOp, MergePlan, OrderBy, Query, SortDirection};
pub use remote::{Document, RemoteStore};

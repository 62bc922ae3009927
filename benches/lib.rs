//! Criterion benches live in the crate root; see `planner_search.rs`
//! and `cache_tiers.rs`.

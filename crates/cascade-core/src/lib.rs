//! # cascade-core: Cascades Query Optimizer Core
//!
//! This crate implements the search machinery of a Cascades-style cost-based query
//! optimizer: the memo holding every equivalent plan, a job framework that breaks the
//! search into small resumable state machines, and a multi-threaded scheduler that runs
//! them.
//!
//! ## Module Overview
//!
//! - **`memo`**, **`group`**, **`group_expression`**: the Memo table, its groups of
//!   equivalent expressions and the expressions themselves, with duplicate detection and
//!   group merging.
//! - **`context`**: optimization contexts (a group under required properties) and cost
//!   contexts (one costed alternative for a context).
//! - **`jobs`**: the seven search jobs (group and expression exploration, implementation
//!   and optimization, plus rule application), each a state machine.
//! - **`job_queue`**: deduplication of jobs doing the same work.
//! - **`scheduler`**: the worker pool with adaptive concurrency.
//! - **`engine`**: search stages, rule selection, result insertion, enforcement and plan
//!   extraction.
//! - **`tree_map`**: counting and ranking every costed plan alternative.
//! - **`stage`**: search stages with time and cost thresholds.
//! - **`enforcement`**: deciding where sort, exchange and spool enforcers are needed.
//! - **`state`**: monotonic lifecycle states shared across threads.
//! - **`expr`**, **`properties`**: operator and property definitions.
//! - **`rule`**, **`pattern`**: the Rule trait, rule registry and pattern matching.
//! - **`cost`**, **`stats`**, **`catalog`**: cost model, statistics derivation and table
//!   metadata.
//! - **`error`**: the optimizer error type.
//!
//! ## Example
//!
//! ```ignore
//! let mut engine = Engine::new(rules, cost_model, catalog, SearchConfig::default());
//! engine.init(QueryContext::new(tree, PhysicalPropertySet::any()), vec![])?;
//! engine.optimize()?;
//! let plan = engine.extract_plan()?;
//! ```

pub mod catalog;
pub mod context;
pub mod cost;
pub mod enforcement;
pub mod engine;
pub mod error;
pub mod expr;
pub mod group;
pub mod group_expression;
pub mod job_queue;
pub mod jobs;
pub mod memo;
pub mod pattern;
pub mod properties;
pub mod rule;
pub mod scheduler;
pub mod stage;
pub mod state;
pub mod stats;
pub mod tree_map;

pub use engine::{Diagnostics, Engine, QueryContext, SearchConfig};
pub use error::{OptimizerError, Result};

//! # Search Stages
//!
//! An optimization runs as an ordered list of search stages. Each stage restricts the
//! rules that may fire and carries a budget:
//!
//! - **time threshold**: once exceeded, no new rule applications are scheduled. Jobs
//!   already running finish normally, so the stage still produces the best plan found
//!   with the expressions it has.
//! - **cost threshold**: a stage whose best plan is at most this expensive ends the
//!   optimization; later stages are skipped.
//!
//! Later stages start from the memo of earlier ones. Rules already applied to an
//! expression are not applied again, so a later stage typically enables more (or more
//! expensive) rules on top of an earlier, cheaper one.

use crate::cost::Cost;
use crate::memo::PlanNode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Rules a stage may apply, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum XformSet {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl XformSet {
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        XformSet::Only(names.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, rule: &str) -> bool {
        match self {
            XformSet::All => true,
            XformSet::Only(names) => names.contains(rule),
        }
    }

    /// Explicitly named rules; empty for `All`.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        let names = match self {
            XformSet::All => None,
            XformSet::Only(names) => Some(names.iter().map(String::as_str)),
        };
        names.into_iter().flatten()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchStage {
    pub xforms: XformSet,
    pub time_threshold_ms: u64,
    pub cost_threshold: f64,
    #[serde(skip)]
    started: Mutex<Option<Instant>>,
    #[serde(skip)]
    best: Mutex<Option<PlanNode>>,
}

impl SearchStage {
    pub fn new(xforms: XformSet, time_threshold_ms: u64, cost_threshold: f64) -> Self {
        Self {
            xforms,
            time_threshold_ms,
            cost_threshold,
            started: Mutex::new(None),
            best: Mutex::new(None),
        }
    }

    /// Stage allowing every rule, without time limit.
    pub fn unbounded() -> Self {
        Self::new(XformSet::All, u64::MAX, 0.0)
    }

    pub fn restart_timer(&self) {
        *self.started.lock() = Some(Instant::now());
    }

    /// Time since the stage started; zero before it starts.
    pub fn elapsed(&self) -> Duration {
        self.started.lock().map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn timed_out(&self) -> bool {
        match *self.started.lock() {
            Some(started) => started.elapsed() >= Duration::from_millis(self.time_threshold_ms),
            None => false,
        }
    }

    pub fn set_best_plan(&self, plan: PlanNode) {
        *self.best.lock() = Some(plan);
    }

    pub fn best_plan(&self) -> Option<PlanNode> {
        self.best.lock().clone()
    }

    pub fn best_cost(&self) -> Option<Cost> {
        self.best.lock().as_ref().map(|p| p.cost)
    }

    /// A plan at most `cost_threshold` expensive was found in this stage.
    pub fn achieved_required_cost(&self) -> bool {
        self.best_cost().is_some_and(|c| c.total <= self.cost_threshold)
    }
}

impl Clone for SearchStage {
    /// Copies the configuration only; the clone has not run.
    fn clone(&self) -> Self {
        Self::new(self.xforms.clone(), self.time_threshold_ms, self.cost_threshold)
    }
}

/// The stage list used when none is given: one stage with every rule and no limits.
pub fn default_stages() -> Vec<SearchStage> {
    vec![SearchStage::unbounded()]
}

//! Call Budget (spec §4.4): cumulative downstream-call accounting,
//! actual-or-estimated, with threshold-based warnings.

use serde::Serialize;

/// Metadata optionally reported by a tool-server response (spec §4.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct CallMeta {
    pub downstream_api_calls: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetWarning {
    None,
    Warn,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BudgetStatus {
    pub remaining: i64,
    pub percent_used: f64,
    pub warning: BudgetWarning,
    pub total: u32,
    pub using_estimates: bool,
}

/// Per-request downstream-call budget (spec §3, §4.4).
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    pub mcp_calls: u32,
    pub actual_downstream: u32,
    pub estimated_downstream: u32,
    pub limit: u32,
    pub default_per_call: u32,
}

impl Budget {
    pub fn new(limit: u32, default_per_call: u32) -> Self {
        Budget {
            mcp_calls: 0,
            actual_downstream: 0,
            estimated_downstream: 0,
            limit,
            default_per_call,
        }
    }

    fn total(&self) -> u32 {
        self.actual_downstream + self.estimated_downstream
    }

    /// Records one downstream call: actual count if reported, otherwise the
    /// per-call estimate.
    pub fn record_call(&mut self, meta: Option<CallMeta>) {
        self.mcp_calls += 1;
        match meta.and_then(|m| m.downstream_api_calls) {
            Some(actual) => self.actual_downstream += actual,
            None => self.estimated_downstream += self.default_per_call,
        }
    }

    pub fn exceeded(&self) -> bool {
        self.total() >= self.limit
    }

    /// True iff the *next* call, charged at the default estimate, would push
    /// the total over the limit.
    pub fn would_exceed(&self) -> bool {
        self.total() + self.default_per_call > self.limit
    }

    pub fn status(&self) -> BudgetStatus {
        let total = self.total();
        let percent_used = if self.limit == 0 {
            100.0
        } else {
            (total as f64 / self.limit as f64) * 100.0
        };
        let warning = if percent_used >= 90.0 {
            BudgetWarning::Critical
        } else if percent_used >= 75.0 {
            BudgetWarning::Warn
        } else {
            BudgetWarning::None
        };
        BudgetStatus {
            remaining: self.limit as i64 - total as i64,
            percent_used,
            warning,
            total,
            using_estimates: self.estimated_downstream > 0,
        }
    }
}

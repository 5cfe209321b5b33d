//! Aggregated summary statistics. Totals are a pure function of the line
//! records they summarize: they are always recomputed from records (lazily,
//! with caching in the model) and never mutated independently.

use serde::{Deserialize, Serialize};

use crate::model::{CoverageState, LineRecord, ReportFile};

/// Counts derived from a set of line records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub files: u64,
    pub hits: u64,
    pub misses: u64,
    pub partials: u64,
    pub branches_taken: u64,
    pub branches_total: u64,
    pub methods_covered: u64,
    pub methods_total: u64,
    pub complexity: u64,
}

impl Totals {
    /// Total instrumented lines.
    #[must_use]
    pub fn lines(&self) -> u64 {
        self.hits + self.misses + self.partials
    }

    pub fn add(&mut self, other: &Totals) {
        self.files += other.files;
        self.hits += other.hits;
        self.misses += other.misses;
        self.partials += other.partials;
        self.branches_taken += other.branches_taken;
        self.branches_total += other.branches_total;
        self.methods_covered += other.methods_covered;
        self.methods_total += other.methods_total;
        self.complexity += other.complexity;
    }

    /// Coverage percentage `hits / (hits + misses + partials) * 100`,
    /// rounded per `config`. `None` when no lines are instrumented.
    #[must_use]
    pub fn coverage(&self, config: &TotalsConfig) -> Option<f64> {
        let total = self.lines();
        if total == 0 {
            return None;
        }
        let pct = self.hits as f64 / total as f64 * 100.0;
        Some(config.rounding.apply(pct, config.precision))
    }

    /// Compute totals for a sequence of line records.
    pub fn from_lines<'a>(lines: impl Iterator<Item = &'a LineRecord>) -> Totals {
        let mut totals = Totals::default();
        for record in lines {
            match record.coverage() {
                CoverageState::Hit => totals.hits += 1,
                CoverageState::Partial => totals.partials += 1,
                CoverageState::Miss => totals.misses += 1,
            }
            totals.branches_total += record.branches.len() as u64;
            totals.branches_taken += record.branches.values().filter(|&&taken| taken).count() as u64;
            if record.method.is_some() {
                totals.methods_total += 1;
                if record.coverage() != CoverageState::Miss {
                    totals.methods_covered += 1;
                }
            }
            totals.complexity += u64::from(record.complexity.unwrap_or(0));
        }
        if totals.lines() > 0 {
            totals.files = 1;
        }
        totals
    }

    /// Sum per-file totals across a report.
    pub fn from_files<'a>(files: impl Iterator<Item = &'a ReportFile>) -> Totals {
        let mut totals = Totals::default();
        for file in files {
            totals.add(file.totals());
        }
        totals
    }
}

/// Rounding applied to coverage percentages. The original system treats this
/// as repository configuration, so it is explicit here rather than inferred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rounding {
    /// Truncate toward zero (the default).
    #[default]
    Down,
    /// Round away from zero.
    Up,
    /// Round half away from zero.
    Nearest,
}

impl Rounding {
    /// Round `value` to `precision` decimal places.
    #[must_use]
    pub fn apply(self, value: f64, precision: u32) -> f64 {
        let factor = 10f64.powi(precision as i32);
        let scaled = value * factor;
        let rounded = match self {
            Rounding::Down => scaled.trunc(),
            Rounding::Up => {
                if scaled.fract() == 0.0 {
                    scaled
                } else {
                    scaled.trunc() + scaled.signum()
                }
            }
            Rounding::Nearest => scaled.round(),
        };
        rounded / factor
    }
}

/// Precision and rounding for coverage ratios, deserializable from the
/// orchestrator's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TotalsConfig {
    pub precision: u32,
    pub rounding: Rounding,
}

impl Default for TotalsConfig {
    fn default() -> TotalsConfig {
        TotalsConfig {
            precision: 2,
            rounding: Rounding::Down,
        }
    }
}

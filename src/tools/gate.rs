// Read Gate & Session Budgets
// Stabilization policy for read-class tools: a read must carry a candidate
// ref issued by a prior search, unless it is a precision read (path +
// line range within the hard cap). Single reads beyond the line budget are
// soft-limited to a truncated preview; session-wide budgets flip later
// unreferenced reads to a hard limit.

use dashmap::DashMap;
use std::collections::HashSet;

use crate::config::BudgetConfig;
use crate::errors::{ClientAction, ErrorCode, SariError};

/// Outcome of a permitted read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAllowance {
    /// Cap the returned preview to this many lines.
    pub truncate_to_lines: Option<usize>,
    /// True when the single-read budget truncated the request.
    pub soft_limited: bool,
}

#[derive(Default)]
struct SessionBudget {
    reads: usize,
    total_lines: usize,
    searched: bool,
    refs: HashSet<String>,
}

/// Per-session read gate.
pub struct ReadGate {
    config: BudgetConfig,
    sessions: DashMap<String, SessionBudget>,
}

impl ReadGate {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    /// Issue candidate refs for a search response. The ref is bound to the
    /// hit path and the snapshot that produced it.
    pub fn issue_refs(&self, session: &str, index_version: &str, paths: &[String]) -> Vec<String> {
        let mut budget = self.sessions.entry(session.to_string()).or_default();
        budget.searched = true;
        paths
            .iter()
            .map(|path| {
                let h = xxhash_rust::xxh3::xxh3_64(
                    format!("{session}\u{0}{index_version}\u{0}{path}").as_bytes(),
                );
                let candidate_ref = format!("cr-{h:016x}");
                budget.refs.insert(candidate_ref.clone());
                candidate_ref
            })
            .collect()
    }

    pub fn has_searched(&self, session: &str) -> bool {
        self.sessions
            .get(session)
            .map(|b| b.searched)
            .unwrap_or(false)
    }

    /// Gate one read request.
    ///
    /// `precision` is the requested `(start_line, end_line)` when both were
    /// given; `requested_lines` is the size of the preview the caller asked
    /// for, used for the single-read soft limit.
    pub fn check_read(
        &self,
        session: &str,
        candidate_ref: Option<&str>,
        precision: Option<(u32, u32)>,
        requested_lines: usize,
    ) -> Result<ReadAllowance, SariError> {
        let budget = self.sessions.entry(session.to_string()).or_default();

        let has_valid_ref = match candidate_ref {
            Some(candidate_ref) => {
                if !budget.refs.contains(candidate_ref) {
                    return Err(SariError::new(
                        ErrorCode::CandidateRefRequired,
                        format!("unknown candidate_ref '{candidate_ref}'"),
                    )
                    .with_hint("use a candidate_ref from a recent search response")
                    .with_action(ClientAction::SearchSymbol));
                }
                true
            }
            None => false,
        };

        let is_precision = match precision {
            Some((start, end)) => {
                if end < start {
                    return Err(SariError::invalid_args(
                        "end_line",
                        "end_line must be >= start_line",
                    ));
                }
                let span = (end - start + 1) as usize;
                span <= self.config.max_range_lines
            }
            None => false,
        };

        if !has_valid_ref && !is_precision {
            return Err(SariError::new(
                ErrorCode::SearchRefRequired,
                "read requires a candidate_ref from search, or a precision range",
            )
            .with_hint(format!(
                "use search to get a candidate_ref, or pass path + start_line + end_line (max {} lines)",
                self.config.max_range_lines
            )));
        }

        // Session-wide budgets: exhausted budgets still honor referenced
        // reads, everything else hard-stops.
        let exhausted = budget.reads >= self.config.max_reads_per_session
            || budget.total_lines >= self.config.max_total_read_lines;
        if exhausted && !has_valid_ref {
            return Err(SariError::new(
                ErrorCode::BudgetHardLimit,
                format!(
                    "session read budget exhausted ({} reads, {} lines)",
                    budget.reads, budget.total_lines
                ),
            )
            .with_hint("use search to narrow scope, then read with a candidate_ref"));
        }

        if requested_lines > self.config.max_single_read_lines {
            return Ok(ReadAllowance {
                truncate_to_lines: Some(self.config.max_single_read_lines),
                soft_limited: true,
            });
        }
        Ok(ReadAllowance {
            truncate_to_lines: None,
            soft_limited: false,
        })
    }

    /// Account a completed read.
    pub fn record_read(&self, session: &str, lines: usize) {
        let mut budget = self.sessions.entry(session.to_string()).or_default();
        budget.reads += 1;
        budget.total_lines += lines;
    }

    /// Budget state string for the stabilization block.
    pub fn budget_state(&self, session: &str) -> String {
        let Some(budget) = self.sessions.get(session) else {
            return "ok".to_string();
        };
        if budget.reads >= self.config.max_reads_per_session
            || budget.total_lines >= self.config.max_total_read_lines
        {
            "hard".to_string()
        } else if budget.reads * 2 >= self.config.max_reads_per_session
            || budget.total_lines * 2 >= self.config.max_total_read_lines
        {
            "soft".to_string()
        } else {
            "ok".to_string()
        }
    }
}

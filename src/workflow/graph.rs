//! Stage transitions
//!
//! ```text
//!            skip_research
//!   Plan ──────────────────────┐
//!    │                         ▼
//!    └──▶ Research ──────▶  Write ──▶ Quality ──▶ End
//!                              ▲          │
//!                              └──────────┘
//!                        needs rewrite, once
//! ```

use super::state::RunState;

/// Rewrite passes allowed after the first write
pub const MAX_REWRITES: u8 = 1;

/// Workflow stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Plan,
    Research,
    Write,
    Quality,
    End,
}

impl Stage {
    /// Node name used in trace events and timings
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::Research => "research",
            Stage::Write => "write",
            Stage::Quality => "quality",
            Stage::End => "end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::End)
    }
}

/// Decide the stage that follows `stage` given the run state.
pub fn next_stage(stage: Stage, state: &RunState) -> Stage {
    match stage {
        Stage::Plan => {
            if state.plan.skip_research {
                Stage::Write
            } else {
                Stage::Research
            }
        }
        Stage::Research => Stage::Write,
        Stage::Write => Stage::Quality,
        Stage::Quality => {
            let needs_rewrite = state.quality.as_ref().is_some_and(|q| q.needs_rewrite());
            if needs_rewrite && state.rewrite_count < MAX_REWRITES {
                Stage::Write
            } else {
                Stage::End
            }
        }
        Stage::End => Stage::End,
    }
}

//! Effort-level presets (spec §6).
//!
//! Loaded as configuration, not reasoned about at runtime: `--effort`
//! resolves once, at startup, into a fixed [`EffortProfile`].

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffortLevel {
    Low,
    Medium,
    High,
    Max,
}

impl fmt::Display for EffortLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EffortLevel::Low => "low",
            EffortLevel::Medium => "medium",
            EffortLevel::High => "high",
            EffortLevel::Max => "max",
        };
        write!(f, "{s}")
    }
}

impl FromStr for EffortLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(EffortLevel::Low),
            "medium" => Ok(EffortLevel::Medium),
            "high" => Ok(EffortLevel::High),
            "max" => Ok(EffortLevel::Max),
            other => Err(format!(
                "invalid effort level '{other}', expected one of: low, medium, high, max"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDepth {
    Shallow,
    Standard,
    Deep,
    Comprehensive,
}

/// Tuning values selected by an [`EffortLevel`]. See spec §6's
/// effort-level table for the literal numbers.
#[derive(Debug, Clone, Copy)]
pub struct EffortProfile {
    pub review_after_enumerate: bool,
    pub review_after_plan: bool,
    pub review_interval: u32,
    pub review_depth: ReviewDepth,
    pub max_revisions: u32,
}

impl EffortLevel {
    pub fn profile(self) -> EffortProfile {
        match self {
            EffortLevel::Low => EffortProfile {
                review_after_enumerate: false,
                review_after_plan: false,
                review_interval: 10,
                review_depth: ReviewDepth::Shallow,
                max_revisions: 2,
            },
            EffortLevel::Medium => EffortProfile {
                review_after_enumerate: false,
                review_after_plan: true,
                review_interval: 5,
                review_depth: ReviewDepth::Standard,
                max_revisions: 3,
            },
            EffortLevel::High => EffortProfile {
                review_after_enumerate: true,
                review_after_plan: true,
                review_interval: 3,
                review_depth: ReviewDepth::Deep,
                max_revisions: 5,
            },
            EffortLevel::Max => EffortProfile {
                review_after_enumerate: true,
                review_after_plan: true,
                review_interval: 1,
                review_depth: ReviewDepth::Comprehensive,
                max_revisions: 8,
            },
        }
    }
}

impl Default for EffortLevel {
    fn default() -> Self {
        EffortLevel::Medium
    }
}

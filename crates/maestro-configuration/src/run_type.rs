use crate::error::QueryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Categorical tag on configuration keys describing the kind of data-taking
/// an entry applies to.
///
/// Run types render as SCREAMING names inside configuration keys; unknown
/// or lowercase names are rejected with [`QueryError::BadKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunType {
    /// No run type; the entry applies to any run
    #[default]
    None,
    /// Physics data-taking
    Physics,
    /// Cosmic-ray data-taking
    Cosmics,
    /// Technical runs
    Technical,
    /// Synthetic data injection runs
    Synthetic,
    /// Detector calibration runs
    Calibration,
}

impl RunType {
    /// The SCREAMING name used inside configuration keys
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::None => "NONE",
            RunType::Physics => "PHYSICS",
            RunType::Cosmics => "COSMICS",
            RunType::Technical => "TECHNICAL",
            RunType::Synthetic => "SYNTHETIC",
            RunType::Calibration => "CALIBRATION",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunType {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(RunType::None),
            "PHYSICS" => Ok(RunType::Physics),
            "COSMICS" => Ok(RunType::Cosmics),
            "TECHNICAL" => Ok(RunType::Technical),
            "SYNTHETIC" => Ok(RunType::Synthetic),
            "CALIBRATION" => Ok(RunType::Calibration),
            _ => Err(QueryError::BadKey),
        }
    }
}

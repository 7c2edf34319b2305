use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Raised when a status or stage string is not a member of its enum.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Lifecycle status of the whole video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    PendingUpload,
    Processing,
    Ready,
    Published,
    Failed,
    Rejected,
    Archived,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::PendingUpload => "pending_upload",
            OverallStatus::Processing => "processing",
            OverallStatus::Ready => "ready",
            OverallStatus::Published => "published",
            OverallStatus::Failed => "failed",
            OverallStatus::Rejected => "rejected",
            OverallStatus::Archived => "archived",
        }
    }

    /// Statuses only a visibility transition may set.
    pub fn is_visibility_target(&self) -> bool {
        matches!(
            self,
            OverallStatus::Published | OverallStatus::Rejected | OverallStatus::Archived
        )
    }
}

impl FromStr for OverallStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending_upload" => Ok(OverallStatus::PendingUpload),
            "processing" => Ok(OverallStatus::Processing),
            "ready" => Ok(OverallStatus::Ready),
            "published" => Ok(OverallStatus::Published),
            "failed" => Ok(OverallStatus::Failed),
            "rejected" => Ok(OverallStatus::Rejected),
            "archived" => Ok(OverallStatus::Archived),
            _ => Err(ParseEnumError::new("overall status", s)),
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one processing stage (media or analysis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Processing => "processing",
            StageStatus::Ready => "ready",
            StageStatus::Failed => "failed",
        }
    }

    /// Pending or processing.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, StageStatus::Pending | StageStatus::Processing)
    }
}

impl FromStr for StageStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(StageStatus::Pending),
            "processing" => Ok(StageStatus::Processing),
            "ready" => Ok(StageStatus::Ready),
            "failed" => Ok(StageStatus::Failed),
            _ => Err(ParseEnumError::new("stage status", s)),
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Independent sub-state machines of a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Media,
    Analysis,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Media => "media",
            Stage::Analysis => "analysis",
        }
    }
}

impl FromStr for Stage {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "media" => Ok(Stage::Media),
            "analysis" => Ok(Stage::Analysis),
            _ => Err(ParseEnumError::new("stage", s)),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(
            "Pending_Upload".parse::<OverallStatus>().unwrap(),
            OverallStatus::PendingUpload
        );
        assert_eq!(" READY ".parse::<StageStatus>().unwrap(), StageStatus::Ready);
        assert_eq!("analysis".parse::<Stage>().unwrap(), Stage::Analysis);
    }

    #[test]
    fn test_parse_rejects_unknown_values() {
        let err = "done".parse::<StageStatus>().unwrap_err();
        assert_eq!(err.kind, "stage status");
        assert_eq!(err.value, "done");
        assert!("".parse::<Stage>().is_err());
        assert!("deleted".parse::<OverallStatus>().is_err());
    }

    #[test]
    fn test_as_str_matches_serde_names() {
        for status in [
            OverallStatus::PendingUpload,
            OverallStatus::Published,
            OverallStatus::Archived,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }
}

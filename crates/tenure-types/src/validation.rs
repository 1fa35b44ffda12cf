//! Definition validation results.
//!
//! Validation never throws: problems come back as a typed list of errors
//! (blocking) and warnings (advisory) with a stable code, the offending step
//! and field where known, and a human-readable message.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    MissingTitle,
    MissingCode,
    MissingProcessType,
    StepsParseError,
    NoSteps,
    MissingStepId,
    DuplicateStepId,
    MissingStepName,
    MissingRequiredConfig,
    MissingRecommendedConfig,
    InvalidNestedStep,
    MissingStartStep,
    MultipleStartSteps,
    MissingEndStep,
    InvalidTransitionTarget,
    InvalidStepReference,
    MultipleDefaultBranches,
    UnreachableStep,
    PotentialInfiniteLoop,
    EndUnreachable,
    RecursiveSubWorkflow,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::MissingTitle => "MISSING_TITLE",
            ValidationCode::MissingCode => "MISSING_CODE",
            ValidationCode::MissingProcessType => "MISSING_PROCESS_TYPE",
            ValidationCode::StepsParseError => "STEPS_PARSE_ERROR",
            ValidationCode::NoSteps => "NO_STEPS",
            ValidationCode::MissingStepId => "MISSING_STEP_ID",
            ValidationCode::DuplicateStepId => "DUPLICATE_STEP_ID",
            ValidationCode::MissingStepName => "MISSING_STEP_NAME",
            ValidationCode::MissingRequiredConfig => "MISSING_REQUIRED_CONFIG",
            ValidationCode::MissingRecommendedConfig => "MISSING_RECOMMENDED_CONFIG",
            ValidationCode::InvalidNestedStep => "INVALID_NESTED_STEP",
            ValidationCode::MissingStartStep => "MISSING_START_STEP",
            ValidationCode::MultipleStartSteps => "MULTIPLE_START_STEPS",
            ValidationCode::MissingEndStep => "MISSING_END_STEP",
            ValidationCode::InvalidTransitionTarget => "INVALID_TRANSITION_TARGET",
            ValidationCode::InvalidStepReference => "INVALID_STEP_REFERENCE",
            ValidationCode::MultipleDefaultBranches => "MULTIPLE_DEFAULT_BRANCHES",
            ValidationCode::UnreachableStep => "UNREACHABLE_STEP",
            ValidationCode::PotentialInfiniteLoop => "POTENTIAL_INFINITE_LOOP",
            ValidationCode::EndUnreachable => "END_UNREACHABLE",
            ValidationCode::RecursiveSubWorkflow => "RECURSIVE_SUB_WORKFLOW",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: ValidationCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ValidationIssue {
    pub fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            step_id: None,
            field: None,
        }
    }

    pub fn for_step(mut self, step_id: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self
    }

    pub fn on_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_id {
            Some(step) => write!(f, "[{}] step '{}': {}", self.code, step, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// Outcome of validating a definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn from_issues(errors: Vec<ValidationIssue>, warnings: Vec<ValidationIssue>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    pub fn has_error(&self, code: ValidationCode) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }

    pub fn has_warning(&self, code: ValidationCode) -> bool {
        self.warnings.iter().any(|w| w.code == code)
    }

    /// All error messages joined for display in a single line.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_valid_only_without_errors() {
        let warning = ValidationIssue::new(ValidationCode::UnreachableStep, "orphan").for_step("x");
        let result = ValidationResult::from_issues(vec![], vec![warning]);
        assert!(result.valid);
        assert!(result.has_warning(ValidationCode::UnreachableStep));

        let err = ValidationIssue::new(ValidationCode::EndUnreachable, "never completes");
        let result = ValidationResult::from_issues(vec![err], vec![]);
        assert!(!result.valid);
        assert!(result.has_error(ValidationCode::EndUnreachable));
    }

    #[test]
    fn test_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ValidationCode::EndUnreachable).unwrap();
        assert_eq!(json, "\"END_UNREACHABLE\"");
        assert_eq!(ValidationCode::StepsParseError.to_string(), "STEPS_PARSE_ERROR");
    }

    #[test]
    fn test_issue_display_includes_step() {
        let issue = ValidationIssue::new(ValidationCode::MissingRequiredConfig, "webhook needs a url")
            .for_step("notify-it")
            .on_field("url");
        let text = issue.to_string();
        assert!(text.contains("MISSING_REQUIRED_CONFIG"));
        assert!(text.contains("notify-it"));
        assert_eq!(issue.field.as_deref(), Some("url"));
    }
}

use parse_display::Display;
use serde::{Deserialize, Serialize};

/// The outcome of one constraint check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidationResult<D> {
    valid: bool,
    diagnostic: Option<D>,
}

impl<D> ValidationResult<D> {
    pub fn new(valid: bool, diagnostic: Option<D>) -> Self {
        Self { valid, diagnostic }
    }
    pub fn valid() -> Self {
        Self::new(true, None)
    }
    pub fn invalid() -> Self {
        Self::new(false, None)
    }
    pub fn valid_with(diagnostic: D) -> Self {
        Self::new(true, Some(diagnostic))
    }
    pub fn invalid_with(diagnostic: D) -> Self {
        Self::new(false, Some(diagnostic))
    }

    /// Returns a valid result if `valid` is `true`, otherwise an invalid result carrying the diagnostic produced by `f`.
    pub fn check(valid: bool, f: impl FnOnce() -> D) -> Self {
        if valid {
            Self::valid()
        } else {
            Self::invalid_with(f())
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
    pub fn diagnostic(&self) -> Option<&D> {
        self.diagnostic.as_ref()
    }
    pub fn into_diagnostic(self) -> Option<D> {
        self.diagnostic
    }
}

/// What a validation run produced: a result, or nothing because the run was cancelled.
///
/// A cancelled run leaves the outcome of its constraint unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationOutcome<D> {
    Completed(ValidationResult<D>),
    Cancelled,
}

impl<D> ValidationOutcome<D> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ValidationOutcome::Cancelled)
    }
}
impl<D> From<ValidationResult<D>> for ValidationOutcome<D> {
    fn from(result: ValidationResult<D>) -> Self {
        ValidationOutcome::Completed(result)
    }
}
impl<D> From<Option<ValidationResult<D>>> for ValidationOutcome<D> {
    fn from(result: Option<ValidationResult<D>>) -> Self {
        match result {
            Some(result) => ValidationOutcome::Completed(result),
            None => ValidationOutcome::Cancelled,
        }
    }
}

/// Aggregate validation state of a set of constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, Serialize, Deserialize)]
#[display(style = "lowercase")]
pub enum ValidationState {
    /// Validation is running, was cancelled, or has not produced a result for every constraint.
    #[default]
    Unknown,
    Valid,
    Invalid,
}

impl ValidationState {
    /// Folds the latest result of each constraint.
    ///
    /// `Invalid` wins over `Unknown`, and an empty set of constraints is `Valid`.
    pub fn aggregate<'a, D: 'a>(
        results: impl IntoIterator<Item = Option<&'a ValidationResult<D>>>,
    ) -> Self {
        Self::from_outcomes(results.into_iter().map(|r| r.map(|r| r.is_valid())))
    }

    pub(crate) fn from_outcomes(outcomes: impl IntoIterator<Item = Option<bool>>) -> Self {
        let mut unknown = false;
        for outcome in outcomes {
            match outcome {
                None => unknown = true,
                Some(false) => return ValidationState::Invalid,
                Some(true) => {}
            }
        }
        if unknown {
            ValidationState::Unknown
        } else {
            ValidationState::Valid
        }
    }
}

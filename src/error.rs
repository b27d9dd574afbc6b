use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("reading collection is empty")]
    EmptyReadings,
    #[error("reading does not carry the channel required by the source model")]
    MissingChannel,
    #[error("expected a finite value but got: {value}")]
    NonFinite { value: f64 },
    #[error("expected a non-negative distance but got: {distance}")]
    NegativeDistance { distance: f64 },
    #[error("expected a finite standard deviation greater than zero but got: {std}")]
    InvalidStandardDeviation { std: f64 },
    #[error("position covariance must be finite, symmetric and positive semi-definite")]
    InvalidPositionCovariance,
    #[error("expected {expected} quality scores but got: {actual}")]
    QualityScoresLengthMismatch { expected: usize, actual: usize },
    #[error("expected a finite non-negative quality score at {index} but got: {score}")]
    InvalidQualityScore { index: usize, score: f64 },
    #[error("expected a threshold greater than zero but got: {threshold}")]
    ThresholdOutOfRange { threshold: f64 },
    #[error("expected confidence in range (0, 1) but got: {confidence}")]
    ConfidenceOutOfRange { confidence: f64 },
    #[error("expected progress delta in range [0, 1] but got: {delta}")]
    ProgressDeltaOutOfRange { delta: f32 },
    #[error("expected at least one iteration but got: {iterations}")]
    MaxIterationsOutOfRange { iterations: usize },
    #[error("expected a subset size of at least {min} but got: {size}")]
    SubsetSizeTooSmall { size: usize, min: usize },
    #[error("source model cannot estimate transmitted power or path loss")]
    UnsupportedTarget,
    #[error("expected a finite path loss exponent greater than zero but got: {exponent}")]
    InvalidPathLossExponent { exponent: f64 },
    #[error("estimator is locked while an estimation is in progress")]
    Locked,
    #[error("estimator is not ready")]
    NotReady,
    #[error("model cannot be solved from the given readings")]
    ModelUnsolvable,
    #[error("refinement failed: {0}")]
    RefinementFailed(&'static str),
    #[error("robust estimation found no valid model after {iterations} iterations")]
    RobustEstimationFailed { iterations: usize },
}

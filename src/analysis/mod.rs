//! Derived insight over the event history and the graph: anomaly
//! classification, status-segment reconstruction, and root-cause search.

mod anomaly;
mod root_cause;
mod status;

pub use self::{
    anomaly::{
        Anomaly, AnomalyCategory, AnomalyClassifier, ClassifierBattery, Severity,
        is_cause_introducing,
    },
    root_cause::{
        CausalStep, NO_ROOT_FOUND, RootCauseAnalyzer, RootCauseCandidate, RootCauseConfig,
        RootCauseError, RootCauseRequest, RootCauseResult, StepEdge,
    },
    status::{ResourceStatus, StatusSegment, build_segments, derive_status},
};

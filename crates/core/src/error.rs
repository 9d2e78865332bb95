use crate::Params;

/// Planner errors, surfaced to the host verbatim.
///
/// `Clone` so one single-flight outcome can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Outside a closed pre-built set.
    #[error("not_found: {0}")]
    NotFound(Params),
    /// Upstream says the entity does not exist. Never cached.
    #[error("entity_not_found: {0}")]
    EntityNotFound(Params),
    #[error("build_failed: {params}: {reason}")]
    BuildFailed { params: Params, reason: String },
    #[error("invalid_params: {0}")]
    InvalidParams(String),
}

impl PlanError {
    pub fn build_failed(params: &Params, reason: impl std::fmt::Display) -> Self {
        PlanError::BuildFailed { params: params.clone(), reason: reason.to_string() }
    }

    /// Terminal errors map to a not-found (or bad request) response; retrying will not help.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PlanError::BuildFailed { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PlanError::NotFound(_) => "not_found",
            PlanError::EntityNotFound(_) => "entity_not_found",
            PlanError::BuildFailed { .. } => "build_failed",
            PlanError::InvalidParams(_) => "invalid_params",
        }
    }
}

pub type PlanResult<T> = Result<T, PlanError>;

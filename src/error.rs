//! Error kinds reported by the simulator's public surface.
//!
//! Setters validate synchronously and return an error without touching
//! simulator state. Solver non-convergence is never an error; it is
//! reported through [`FrameStats`](crate::simulation::FrameStats).

/// Errors raised by configuration and data-access operations.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// A parameter value is outside its documented domain.
    #[error("domain error: {0}")]
    DomainError(String),

    /// A grid or particle index is out of range.
    #[error("index out of range: {0}")]
    OutOfRange(String),

    /// An obstacle, source, or attribute with this identity already exists.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// `update` was called before `initialize`.
    #[error("simulation is not initialized")]
    NotInitialized,
}

pub type Result<T> = std::result::Result<T, SimulationError>;

impl SimulationError {
    /// Shorthand for a `DomainError` with a formatted message.
    pub fn domain(msg: impl Into<String>) -> Self {
        SimulationError::DomainError(msg.into())
    }
}

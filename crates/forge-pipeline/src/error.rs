use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The pipeline was shut down; the event was dropped.
    #[error("pipeline is shut down")]
    ShutDown,
}

use groupcast_bulk::BulkError;

/// Rejections the control surface reports back to the operator.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("transport is not ready")]
    TransportNotReady,
    #[error("destination is required")]
    MissingDestination,
    #[error("campaign has no messages")]
    EmptyCampaign,
    #[error("forwarding is disabled or has no target")]
    ForwardingDisabled,
    #[error("engine is stopped")]
    EngineStopped,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<BulkError> for DispatchError {
    fn from(err: BulkError) -> Self {
        match err {
            BulkError::TransportNotReady => DispatchError::TransportNotReady,
            BulkError::MissingDestination => DispatchError::MissingDestination,
            BulkError::EmptyCampaign => DispatchError::EmptyCampaign,
            BulkError::Storage(e) => DispatchError::Other(e),
        }
    }
}

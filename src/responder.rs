use crate::connection::BoxedConnection;
use std::sync::Arc;
use tracing::debug;

/// Answers unroutable connections with a fixed payload and closes them
#[derive(Debug, Clone)]
pub struct RejectionResponder {
    payload: Arc<[u8]>,
}

impl RejectionResponder {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: Arc::from(payload.into()),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn respond(&self, conn: BoxedConnection) {
        debug!(connection = %conn.id(), bytes = self.payload.len(), "Rejecting connection");
        conn.reject(Arc::clone(&self.payload));
    }
}

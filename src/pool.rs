//! Backend pool with lazy pruning and least-load selection

use crate::backend::{BackendHandle, BackendStatus};
use crate::error::DispatchError;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Pool shared between the dispatcher and the server
pub type SharedPool = Arc<Mutex<BackendPool>>;

/// Ordered set of backends eligible for traffic.
///
/// Order is registration order and doubles as the tie-break order. The only
/// mutation is removal of dead handles.
#[derive(Debug, Default)]
pub struct BackendPool {
    handles: Vec<Arc<BackendHandle>>,
}

impl BackendPool {
    pub fn new(handles: Vec<Arc<BackendHandle>>) -> Self {
        Self { handles }
    }

    pub fn shared(self) -> SharedPool {
        Arc::new(Mutex::new(self))
    }

    pub fn handles(&self) -> &[Arc<BackendHandle>] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Drop every dead handle, returning how many were removed
    pub fn prune(&mut self) -> usize {
        let before = self.handles.len();
        self.handles.retain(|handle| {
            if handle.dead() {
                info!(
                    backend = handle.id(),
                    address = %handle.address(),
                    "Removing dead backend from pool"
                );
                false
            } else {
                true
            }
        });
        before - self.handles.len()
    }

    /// Prune, then pick the ready backend with the lowest load.
    ///
    /// `Ok(None)` means nothing is ready yet. Fails once no backend is left
    /// at all, and keeps failing from then on.
    pub fn select_least_loaded(&mut self) -> Result<Option<Arc<BackendHandle>>, DispatchError> {
        self.prune();
        if self.handles.is_empty() {
            return Err(DispatchError::BackendPoolExhausted);
        }

        // min_by_key keeps the first of several equal minimums
        Ok(self
            .handles
            .iter()
            .filter(|handle| handle.ready())
            .min_by_key(|handle| handle.load())
            .cloned())
    }

    pub fn ready_count(&self) -> usize {
        self.handles.iter().filter(|handle| handle.ready()).count()
    }

    pub fn status(&self) -> Vec<BackendStatus> {
        self.handles.iter().map(|handle| handle.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendState;
    use crate::probe::ProbeConfig;
    use crate::process::mock::MockProcess;

    fn pool_of(n: usize) -> BackendPool {
        let handles = (1..=n)
            .map(|id| {
                let address = format!("127.0.0.1:{}", 9000 + id).parse().unwrap();
                BackendHandle::new(id, MockProcess::new(address), ProbeConfig::default())
            })
            .collect();
        BackendPool::new(handles)
    }

    fn set_all(pool: &BackendPool, state: BackendState) {
        for handle in pool.handles() {
            handle.force_state(state);
        }
    }

    #[test]
    fn test_selects_least_loaded() {
        let mut pool = pool_of(3);
        set_all(&pool, BackendState::Ready);

        let _a = pool.handles()[0].acquire();
        let _b = pool.handles()[0].acquire();
        let _c = pool.handles()[1].acquire();

        let selected = pool.select_least_loaded().unwrap().unwrap();
        assert_eq!(selected.id(), 3);
    }

    #[test]
    fn test_tie_goes_to_first_registered() {
        let mut pool = pool_of(3);
        set_all(&pool, BackendState::Ready);

        let selected = pool.select_least_loaded().unwrap().unwrap();
        assert_eq!(selected.id(), 1);

        let _a = pool.handles()[0].acquire();
        let selected = pool.select_least_loaded().unwrap().unwrap();
        assert_eq!(selected.id(), 2);
    }

    #[test]
    fn test_only_ready_backends_are_selected() {
        let mut pool = pool_of(3);
        pool.handles()[0].force_state(BackendState::Connecting);
        pool.handles()[2].force_state(BackendState::Ready);

        // Backend 3 is busy but it is the only ready one
        let _a = pool.handles()[2].acquire();
        let selected = pool.select_least_loaded().unwrap().unwrap();
        assert_eq!(selected.id(), 3);
        assert_eq!(pool.ready_count(), 1);
    }

    #[test]
    fn test_none_ready_yet() {
        let mut pool = pool_of(2);
        set_all(&pool, BackendState::Connecting);

        assert!(pool.select_least_loaded().unwrap().is_none());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_dead_backends_are_pruned() {
        let mut pool = pool_of(3);
        set_all(&pool, BackendState::Ready);
        pool.handles()[0].force_state(BackendState::Dead);

        let selected = pool.select_least_loaded().unwrap().unwrap();
        assert_eq!(selected.id(), 2);
        assert_eq!(pool.len(), 2);
        assert!(pool.handles().iter().all(|h| !h.dead()));
    }

    #[test]
    fn test_prune_keeps_order() {
        let mut pool = pool_of(4);
        pool.handles()[1].force_state(BackendState::Dead);

        assert_eq!(pool.prune(), 1);
        let ids: Vec<usize> = pool.handles().iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec![1, 3, 4]);
        assert_eq!(pool.prune(), 0);
    }

    #[test]
    fn test_exhaustion_is_stable() {
        let mut pool = pool_of(2);
        set_all(&pool, BackendState::Dead);

        assert_eq!(
            pool.select_least_loaded().unwrap_err(),
            DispatchError::BackendPoolExhausted
        );
        assert!(pool.is_empty());
        assert_eq!(
            pool.select_least_loaded().unwrap_err(),
            DispatchError::BackendPoolExhausted
        );
    }

    #[test]
    fn test_status() {
        let pool = pool_of(2);
        let status = pool.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].id, 1);
        assert_eq!(status[1].address, "127.0.0.1:9002");
    }
}

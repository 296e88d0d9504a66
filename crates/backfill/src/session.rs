//! Checkout/checkin pool of transactional sessions. Each worker owns one
//! session for its lifetime; the pool is the only shared mutable resource at
//! worker level and returns sessions on drop.

use std::sync::Arc;

use async_trait::async_trait;
use kv::{
    Mutation,
    Priority,
    Session,
    Store,
    Version,
};
use parking_lot::Mutex;

pub struct SessionPool {
    store: Arc<dyn Store>,
    idle: Mutex<Vec<Box<dyn Session>>>,
}

impl SessionPool {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(self: &Arc<Self>) -> anyhow::Result<PooledSession> {
        let session = match self.idle.lock().pop() {
            Some(session) => session,
            None => self.store.session()?,
        };
        Ok(PooledSession {
            session: Some(session),
            pool: self.clone(),
        })
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A session checked out of the pool; returns itself on drop.
pub struct PooledSession {
    session: Option<Box<dyn Session>>,
    pool: Arc<SessionPool>,
}

#[async_trait]
impl Session for PooledSession {
    async fn write(
        &mut self,
        mutations: Vec<Mutation>,
        priority: Priority,
    ) -> anyhow::Result<Version> {
        let Some(session) = self.session.as_mut() else {
            anyhow::bail!("session already returned to its pool");
        };
        session.write(mutations, priority).await
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.idle.lock().push(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kv::memory::MemoryStore;

    use super::SessionPool;

    #[test]
    fn test_sessions_recycle_on_drop() {
        let pool = Arc::new(SessionPool::new(Arc::new(MemoryStore::new())));
        assert_eq!(pool.idle_count(), 0);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(), 2);

        let _c = pool.acquire().unwrap();
        assert_eq!(pool.idle_count(), 1);
    }
}

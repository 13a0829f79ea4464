use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use crate::database::{Database, RETRY_DELAY};
use crate::error::StoreError;

/// A fixed set of [`Database`] handles on one file.
///
/// [`get`](Pool::get) blocks until a handle is free. The returned guard puts
/// the handle back when dropped, so every get is paired with exactly one
/// put.
pub struct Pool {
    slots: Vec<Mutex<Database>>,
    idle: Mutex<Vec<usize>>,
    available: Condvar,
    path: PathBuf,
}

impl Pool {
    pub fn open(path: &Path, size: usize) -> Result<Self, StoreError> {
        Self::open_with_retry(path, size, RETRY_DELAY)
    }

    pub fn open_with_retry(
        path: &Path,
        size: usize,
        retry_delay: Duration,
    ) -> Result<Self, StoreError> {
        if size == 0 {
            return Err(StoreError::InvalidValue("pool size must be at least 1".into()));
        }

        let slots = (0..size)
            .map(|_| Database::open_with_retry(path, retry_delay).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;

        info!(path = %path.display(), size, "database pool opened");
        Ok(Self {
            slots,
            idle: Mutex::new((0..size).rev().collect()),
            available: Condvar::new(),
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Handles not currently checked out.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Check out a handle, blocking until one is returned if all are busy.
    pub fn get(&self) -> PooledDatabase<'_> {
        let mut idle = self.idle.lock();
        loop {
            if let Some(index) = idle.pop() {
                drop(idle);
                trace!(slot = index, "database handle checked out");
                return self.checkout(index);
            }
            self.available.wait(&mut idle);
        }
    }

    /// Check out a handle without waiting.
    pub fn try_get(&self) -> Option<PooledDatabase<'_>> {
        let index = self.idle.lock().pop()?;
        Some(self.checkout(index))
    }

    /// Return a handle. Equivalent to dropping the guard.
    pub fn put(&self, db: PooledDatabase<'_>) {
        drop(db);
    }

    fn checkout(&self, index: usize) -> PooledDatabase<'_> {
        PooledDatabase {
            pool: self,
            index,
            db: self.slots[index].lock(),
        }
    }

    fn release(&self, index: usize) {
        self.idle.lock().push(index);
        self.available.notify_one();
    }

    /// Close every handle. Consumes the pool, so no guard can be live.
    pub fn close(self) -> Result<(), StoreError> {
        let mut first_error = None;
        for slot in self.slots {
            if let Err(e) = slot.into_inner().close() {
                warn!(error = %e, "failed to close pooled database");
                first_error.get_or_insert(e);
            }
        }
        debug!(path = %self.path.display(), "database pool closed");
        first_error.map_or(Ok(()), Err)
    }
}

/// A checked-out handle; derefs to [`Database`].
pub struct PooledDatabase<'a> {
    pool: &'a Pool,
    index: usize,
    db: MutexGuard<'a, Database>,
}

impl Deref for PooledDatabase<'_> {
    type Target = Database;

    fn deref(&self) -> &Database {
        &self.db
    }
}

impl DerefMut for PooledDatabase<'_> {
    fn deref_mut(&mut self) -> &mut Database {
        &mut self.db
    }
}

impl Drop for PooledDatabase<'_> {
    fn drop(&mut self) {
        if self.db.in_transaction() {
            warn!(slot = self.index, "handle returned with an open transaction, rolling back");
            if let Err(e) = self.db.rollback() {
                warn!(slot = self.index, error = %e, "rollback on return failed");
            }
        }
        self.pool.release(self.index);
        trace!(slot = self.index, "database handle returned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logship_core::Host;
    use std::sync::mpsc;
    use std::thread;

    fn pool(size: usize) -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(&dir.path().join("logship.db"), size).unwrap();
        (dir, pool)
    }

    #[test]
    fn zero_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Pool::open(&dir.path().join("x.db"), 0),
            Err(StoreError::InvalidValue(_))
        ));
    }

    #[test]
    fn guards_return_handles() {
        let (_dir, pool) = pool(2);
        assert_eq!(pool.idle_count(), 2);
        let a = pool.get();
        let b = pool.get();
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.try_get().is_none());
        pool.put(a);
        assert_eq!(pool.idle_count(), 1);
        drop(b);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn handles_share_the_file() {
        let (_dir, pool) = pool(2);
        let mut a = pool.get();
        let b = pool.get();
        a.host_add(&mut Host::new("web01")).unwrap();
        assert!(b.host_get_by_name("web01").unwrap().is_some());
    }

    #[test]
    fn get_blocks_until_put() {
        let (_dir, pool) = pool(1);
        let held = pool.get();
        let (tx, rx) = mpsc::channel();

        thread::scope(|s| {
            s.spawn(|| {
                let db = pool.get();
                tx.send(db.path().to_path_buf()).unwrap();
            });

            assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
            drop(held);
            assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        });
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn open_transaction_is_rolled_back_on_return() {
        let (_dir, pool) = pool(1);
        {
            let mut db = pool.get();
            db.begin().unwrap();
            db.host_add(&mut Host::new("abandoned")).unwrap();
        }
        let db = pool.get();
        assert!(!db.in_transaction());
        assert!(db.host_get_all().unwrap().is_empty());
    }

    #[test]
    fn close_consumes_pool() {
        let (_dir, pool) = pool(3);
        pool.close().unwrap();
    }
}

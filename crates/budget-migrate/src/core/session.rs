//! Scoped suspension of foreign key checks on a write session.

use tracing::{debug, warn};

use super::schema::TableMigrationSpec;
use super::traits::WriteSession;
use super::value::Row;
use crate::error::Result;

/// Owns a [`WriteSession`] and guarantees that foreign key checks suspended
/// through it are turned back on.
///
/// Call [`restore`](Self::restore) on the normal path. If the scope is left
/// early (an error bubbling up through `?`, a panic, a dropped future), `Drop`
/// re-enables the checks through the session's detached restore.
pub struct ForeignKeyScope {
    session: Box<dyn WriteSession>,
    suspended: bool,
}

impl ForeignKeyScope {
    /// Wrap a session. Checks stay enabled until [`suspend`](Self::suspend).
    pub fn new(session: Box<dyn WriteSession>) -> Self {
        Self {
            session,
            suspended: false,
        }
    }

    /// Disable foreign key checks for the rest of the scope.
    pub async fn suspend(&mut self) -> Result<()> {
        if !self.suspended {
            self.session.set_foreign_key_checks(false).await?;
            self.suspended = true;
            debug!("foreign key checks suspended");
        }
        Ok(())
    }

    /// Suspend only when `spec` references other tables.
    pub async fn suspend_for(&mut self, spec: &TableMigrationSpec) -> Result<()> {
        if spec.has_dependencies() {
            self.suspend().await?;
        }
        Ok(())
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Insert through the wrapped session.
    pub async fn insert_row(&mut self, spec: &TableMigrationSpec, row: &Row) -> Result<i64> {
        self.session.insert_row(spec, row).await
    }

    pub async fn update_row(&mut self, spec: &TableMigrationSpec, id: i64, row: &Row) -> Result<()> {
        self.session.update_row(spec, id, row).await
    }

    /// Re-enable checks and release the session.
    pub async fn restore(mut self) -> Result<()> {
        if self.suspended {
            // Cleared first: if the statement fails, Drop must not retry it on
            // a connection that is already broken.
            self.suspended = false;
            self.session.set_foreign_key_checks(true).await?;
            debug!("foreign key checks restored");
        }
        Ok(())
    }
}

impl Drop for ForeignKeyScope {
    fn drop(&mut self) {
        if self.suspended {
            warn!("foreign key scope dropped while suspended, restoring in background");
            self.session.restore_foreign_key_checks_detached();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    type Log = Mutex<Vec<&'static str>>;

    struct RecordingSession(Arc<Log>);

    #[async_trait]
    impl WriteSession for RecordingSession {
        async fn insert_row(&mut self, _spec: &TableMigrationSpec, _row: &Row) -> Result<i64> {
            self.0.lock().unwrap().push("insert");
            Ok(1)
        }

        async fn update_row(&mut self, _spec: &TableMigrationSpec, _id: i64, _row: &Row) -> Result<()> {
            self.0.lock().unwrap().push("update");
            Ok(())
        }

        async fn set_foreign_key_checks(&mut self, enabled: bool) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .push(if enabled { "enable" } else { "disable" });
            Ok(())
        }

        fn restore_foreign_key_checks_detached(&mut self) {
            self.0.lock().unwrap().push("detached");
        }
    }

    fn scope() -> (ForeignKeyScope, Arc<Log>) {
        let log = Arc::new(Log::default());
        (
            ForeignKeyScope::new(Box::new(RecordingSession(log.clone()))),
            log,
        )
    }

    #[tokio::test]
    async fn test_suspend_and_restore_once() {
        let (mut scope, log) = scope();
        scope.suspend().await.unwrap();
        scope.suspend().await.unwrap();
        scope.restore().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["disable", "enable"]);
    }

    #[tokio::test]
    async fn test_drop_restores_detached() {
        let (mut scope, log) = scope();
        scope.suspend().await.unwrap();
        drop(scope);
        assert_eq!(*log.lock().unwrap(), vec!["disable", "detached"]);
    }

    #[tokio::test]
    async fn test_untouched_scope_does_nothing() {
        let (scope, log) = scope();
        drop(scope);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_independent_table_not_suspended() {
        let (mut scope, log) = scope();
        scope
            .suspend_for(&crate::core::catalog::USERS_SPEC)
            .await
            .unwrap();
        assert!(!scope.is_suspended());
        scope
            .suspend_for(&crate::core::catalog::CATEGORIES_SPEC)
            .await
            .unwrap();
        assert!(scope.is_suspended());
        scope.restore().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["disable", "enable"]);
    }
}

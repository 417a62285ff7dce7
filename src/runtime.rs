//! Shared per-process state threaded into every injector.
//!
//! One `InjectorRuntime` exists per server process: the database handle
//! pool, the three process-wide name caches, the live mailbox registry,
//! injection counters, and the cluster notification channel.

use crate::cache::NameCache;
use crate::mailbox::MailboxRegistry;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct InjectorRuntime {
    pool: PgPool,
    pub flag_names: NameCache,
    pub annotation_names: NameCache,
    pub field_names: NameCache,
    pub mailboxes: MailboxRegistry,
    injected: AtomicU64,
    errors: AtomicU64,
    notifier: broadcast::Sender<String>,
}

impl InjectorRuntime {
    pub fn new(pool: PgPool) -> Arc<Self> {
        let (notifier, _) = broadcast::channel(256);
        Arc::new(Self {
            pool,
            flag_names: NameCache::new("flag_names"),
            annotation_names: NameCache::new("annotation_names"),
            field_names: NameCache::new("field_names"),
            mailboxes: MailboxRegistry::new(),
            injected: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            notifier,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Warm the name caches from the database. Flag names are cached under
    /// their lowercased form; field and annotation names verbatim.
    pub async fn preload_caches(&self) -> Result<(), sqlx::Error> {
        self.flag_names.preload(&self.pool, true).await?;
        self.annotation_names.preload(&self.pool, false).await?;
        self.field_names.preload(&self.pool, false).await?;
        Ok(())
    }

    /// Subscribe to cluster notifications
    /// (`mailbox "<name>" uidnext=<n> nextmodseq=<m>`).
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.notifier.subscribe()
    }

    pub(crate) fn notify(&self, message: String) {
        // Absent subscribers are fine; notifications are best effort.
        let _ = self.notifier.send(message);
    }

    pub(crate) fn tick_injected(&self) {
        self.injected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tick_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    pub fn injection_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

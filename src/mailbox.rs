//! In-process mailbox state and live sessions.
//!
//! `MailboxState` mirrors the `mailboxes` row the server currently believes
//! in: `uidnext`, `nextmodseq`, and `first_recent`, plus the IMAP sessions
//! with the mailbox selected. Sessions reference their mailbox by id and are
//! reached through the registry, so there is no reference cycle between the
//! two.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// A live IMAP session with a mailbox selected.
///
/// Tracks the UIDs this session owns as `\Recent` and the UIDs injected but
/// not yet announced to the client.
pub struct Session {
    id: u64,
    mailbox_id: i32,
    recent: Mutex<BTreeSet<i32>>,
    unannounced: Mutex<BTreeSet<i32>>,
}

impl Session {
    pub fn new(id: u64, mailbox_id: i32) -> Arc<Self> {
        Arc::new(Self {
            id,
            mailbox_id,
            recent: Mutex::new(BTreeSet::new()),
            unannounced: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mailbox_id(&self) -> i32 {
        self.mailbox_id
    }

    pub fn add_recent(&self, uid: i32) {
        self.recent.lock().expect("session state lock").insert(uid);
    }

    pub fn add_unannounced(&self, uid: i32) {
        self.unannounced
            .lock()
            .expect("session state lock")
            .insert(uid);
    }

    pub fn recent(&self) -> Vec<i32> {
        self.recent
            .lock()
            .expect("session state lock")
            .iter()
            .copied()
            .collect()
    }

    /// Drain the unannounced set; the protocol layer calls this when it
    /// emits EXISTS/FETCH updates.
    pub fn take_unannounced(&self) -> Vec<i32> {
        let mut set = self.unannounced.lock().expect("session state lock");
        let uids = set.iter().copied().collect();
        set.clear();
        uids
    }

    pub fn unannounced(&self) -> Vec<i32> {
        self.unannounced
            .lock()
            .expect("session state lock")
            .iter()
            .copied()
            .collect()
    }
}

/// In-process view of one mailbox.
pub struct MailboxState {
    id: i32,
    name: String,
    uidnext: AtomicI32,
    nextmodseq: AtomicI64,
    first_recent: AtomicI32,
    sessions: Mutex<Vec<Arc<Session>>>,
}

impl MailboxState {
    pub fn new(id: i32, name: &str, uidnext: i32, nextmodseq: i64, first_recent: i32) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_string(),
            uidnext: AtomicI32::new(uidnext),
            nextmodseq: AtomicI64::new(nextmodseq),
            first_recent: AtomicI32::new(first_recent),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uidnext(&self) -> i32 {
        self.uidnext.load(Ordering::Acquire)
    }

    pub fn nextmodseq(&self) -> i64 {
        self.nextmodseq.load(Ordering::Acquire)
    }

    pub fn first_recent(&self) -> i32 {
        self.first_recent.load(Ordering::Acquire)
    }

    /// Advance `uidnext` to at least `value`. Returns true if this call
    /// raised it, i.e. the change still needs announcing.
    pub fn advance_uidnext(&self, value: i32) -> bool {
        self.uidnext.fetch_max(value, Ordering::AcqRel) < value
    }

    /// Advance `nextmodseq` to at least `value`, as `advance_uidnext`.
    pub fn advance_nextmodseq(&self, value: i64) -> bool {
        self.nextmodseq.fetch_max(value, Ordering::AcqRel) < value
    }

    pub fn attach_session(&self, session: Arc<Session>) {
        self.sessions
            .lock()
            .expect("mailbox session lock")
            .push(session);
    }

    pub fn detach_session(&self, session_id: u64) {
        self.sessions
            .lock()
            .expect("mailbox session lock")
            .retain(|s| s.id() != session_id);
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().expect("mailbox session lock").clone()
    }

    /// The session that will own `\Recent` for newly injected UIDs, if any.
    pub fn first_session(&self) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("mailbox session lock")
            .first()
            .cloned()
    }

    pub fn has_sessions(&self) -> bool {
        !self.sessions.lock().expect("mailbox session lock").is_empty()
    }
}

/// Registry of live mailboxes, keyed by the stable mailbox id.
#[derive(Default)]
pub struct MailboxRegistry {
    by_id: DashMap<i32, Arc<MailboxState>>,
}

impl MailboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mailbox: Arc<MailboxState>) {
        self.by_id.insert(mailbox.id(), mailbox);
    }

    pub fn get(&self, id: i32) -> Option<Arc<MailboxState>> {
        self.by_id.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

//! Per-mailbox UID and modseq allocation.
//!
//! UIDs come out of `mailboxes.uidnext` under a row lock rather than a
//! sequence, so that commit order and UID order agree. The lock is held
//! until the injection transaction ends, and locks are taken in sorted
//! mailbox-id order; two injectors targeting overlapping mailboxes
//! therefore serialize instead of deadlocking.

use crate::mailbox::MailboxState;
use sqlx::{Postgres, Transaction};
use std::sync::Arc;

const LOCK_UIDNEXT: &str =
    "SELECT uidnext, nextmodseq, first_recent FROM mailboxes WHERE id=$1 FOR UPDATE";
const INCR_UIDNEXT: &str =
    "UPDATE mailboxes SET uidnext=uidnext+1, nextmodseq=nextmodseq+1 WHERE id=$1";
const INCR_UIDNEXT_WITH_RECENT: &str = "UPDATE mailboxes \
     SET uidnext=uidnext+1, nextmodseq=nextmodseq+1, first_recent=first_recent+1 WHERE id=$1";

/// The UID space is 32-bit signed; start shouting well before it runs out.
const UID_WARN: i32 = 0x7fff_0000;
const UID_DISASTER: i32 = 0x7fff_fff0;

/// One target mailbox being injected into, with its assignment once
/// allocation has run.
pub struct MailboxTarget {
    pub(crate) mailbox: Arc<MailboxState>,
    /// Assigned UID; 0 until allocation.
    pub(crate) uid: i32,
    /// Assigned modseq; 0 until allocation.
    pub(crate) modseq: i64,
    /// Session that gets `\Recent` for this UID, if any.
    pub(crate) recent_in: Option<u64>,
}

impl MailboxTarget {
    pub(crate) fn new(mailbox: Arc<MailboxState>) -> Self {
        Self {
            mailbox,
            uid: 0,
            modseq: 0,
            recent_in: None,
        }
    }
}

/// Allocate a UID and modseq for every target, in the targets' (sorted)
/// order.
pub(crate) async fn allocate(
    tx: &mut Transaction<'_, Postgres>,
    targets: &mut [MailboxTarget],
) -> Result<(), sqlx::Error> {
    for target in targets.iter_mut() {
        let mailbox_id = target.mailbox.id();
        let (uidnext, nextmodseq, first_recent): (i32, i64, i32) = sqlx::query_as(LOCK_UIDNEXT)
            .bind(mailbox_id)
            .fetch_one(&mut **tx)
            .await?;

        if uidnext > UID_DISASTER {
            log::error!(
                "mailbox {} has only {} usable UIDs left",
                target.mailbox.name(),
                i32::MAX - uidnext
            );
        } else if uidnext > UID_WARN {
            log::warn!(
                "mailbox {} has only {} usable UIDs left",
                target.mailbox.name(),
                i32::MAX - uidnext
            );
        }

        // The first session to see a new UID owns its `\Recent` flag; the
        // first_recent bump claims it inside the same lock.
        let mut update = INCR_UIDNEXT;
        if uidnext == first_recent {
            if let Some(session) = target.mailbox.first_session() {
                target.recent_in = Some(session.id());
                update = INCR_UIDNEXT_WITH_RECENT;
            }
        }

        sqlx::query(update)
            .bind(mailbox_id)
            .execute(&mut **tx)
            .await?;

        target.uid = uidnext;
        target.modseq = nextmodseq;
    }

    Ok(())
}

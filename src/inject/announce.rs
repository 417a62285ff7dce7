//! Post-commit announcement.
//!
//! Runs only after the injection transaction has committed: pushes the new
//! UIDs into live sessions, advances the in-process mailbox counters, and
//! emits cluster notifications so other server processes catch up. Local
//! mailbox objects are updated immediately to keep behavior within one
//! process deterministic.

use crate::inject::uids::MailboxTarget;
use crate::runtime::InjectorRuntime;

pub(crate) fn announce(runtime: &InjectorRuntime, targets: &[MailboxTarget]) {
    for target in targets {
        let uid = target.uid;
        let mailbox = &target.mailbox;

        for session in mailbox.sessions() {
            if target.recent_in == Some(session.id()) {
                session.add_recent(uid);
            }
            session.add_unannounced(uid);
        }

        let uid_changed = mailbox.advance_uidnext(uid + 1);
        let modseq_changed = mailbox.advance_nextmodseq(target.modseq + 1);

        let mut updates = Vec::with_capacity(2);
        if uid_changed {
            updates.push(format!("uidnext={}", mailbox.uidnext()));
        }
        if modseq_changed {
            updates.push(format!("nextmodseq={}", mailbox.nextmodseq()));
        }
        if !updates.is_empty() {
            runtime.notify(format!(
                "mailbox {} {}",
                quoted(mailbox.name()),
                updates.join(" ")
            ));
        }
    }
}

/// Quote a mailbox name for the cluster notification line.
fn quoted(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{MailboxState, Session};

    #[test]
    fn quoting_escapes_specials() {
        assert_eq!(quoted("INBOX"), "\"INBOX\"");
        assert_eq!(quoted("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }

    #[tokio::test]
    async fn announce_updates_sessions_and_counters() {
        let runtime = InjectorRuntime::new(
            sqlx::postgres::PgPoolOptions::new()
                .max_connections(1)
                .connect_lazy("postgres://localhost/unused")
                .expect("lazy pool"),
        );
        let mut rx = runtime.subscribe();

        let mailbox = MailboxState::new(1, "INBOX", 100, 40, 100);
        let session = Session::new(9, 1);
        mailbox.attach_session(session.clone());

        let mut target = MailboxTarget::new(mailbox.clone());
        target.uid = 100;
        target.modseq = 40;
        target.recent_in = Some(9);

        announce(&runtime, &[target]);

        assert_eq!(session.recent(), vec![100]);
        assert_eq!(session.unannounced(), vec![100]);
        assert_eq!(mailbox.uidnext(), 101);
        assert_eq!(mailbox.nextmodseq(), 41);

        let line = rx.try_recv().expect("notification emitted");
        assert_eq!(line, "mailbox \"INBOX\" uidnext=101 nextmodseq=41");
    }

    #[tokio::test]
    async fn announce_omits_unchanged_keys() {
        let runtime = InjectorRuntime::new(
            sqlx::postgres::PgPoolOptions::new()
                .max_connections(1)
                .connect_lazy("postgres://localhost/unused")
                .expect("lazy pool"),
        );
        let mut rx = runtime.subscribe();

        // Another injector already advanced uidnext past ours.
        let mailbox = MailboxState::new(1, "INBOX", 120, 40, 100);
        let mut target = MailboxTarget::new(mailbox.clone());
        target.uid = 100;
        target.modseq = 40;

        announce(&runtime, &[target]);

        assert_eq!(mailbox.uidnext(), 120);
        let line = rx.try_recv().expect("notification emitted");
        assert_eq!(line, "mailbox \"INBOX\" nextmodseq=41");
    }
}

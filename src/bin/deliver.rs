use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use mailstore::config::DbConfig;
use mailstore::mailbox::MailboxState;
use mailstore::model::{ingest, Address};
use mailstore::{db, Injector, InjectorRuntime};

#[derive(Parser, Debug)]
#[command(
    name = "deliver",
    about = "Inject an RFC 822 message file into the mail store"
)]
struct Args {
    /// Path to the message file.
    file: PathBuf,

    /// Target mailbox name; repeat for multiple mailboxes.
    #[arg(long = "mailbox")]
    mailboxes: Vec<String>,

    /// Remote recipient address; repeat for multiple recipients. The
    /// message is spooled for outbound delivery instead of (or besides)
    /// local storage.
    #[arg(long = "remote")]
    remote: Vec<String>,

    /// Envelope sender, required with --remote.
    #[arg(long)]
    sender: Option<String>,

    /// IMAP flag to set on the stored message; repeatable.
    #[arg(long = "flag")]
    flags: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();

    let raw = std::fs::read(&args.file)?;
    let message = ingest::message_from_bytes(&raw)?;

    let pool = db::connect(&DbConfig::from_env()).await?;
    db::run_migrations(&pool).await?;

    let runtime = InjectorRuntime::new(pool.clone());
    runtime.preload_caches().await?;

    let mut mailboxes = Vec::new();
    for name in &args.mailboxes {
        let row: Option<(i32, String, i32, i64, i32)> = sqlx::query_as(
            "SELECT id, name, uidnext, nextmodseq, first_recent FROM mailboxes WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&pool)
        .await?;

        match row {
            Some((id, name, uidnext, nextmodseq, first_recent)) => {
                let state = MailboxState::new(id, &name, uidnext, nextmodseq, first_recent);
                runtime.mailboxes.insert(state.clone());
                mailboxes.push(state);
            }
            None => {
                writeln!(io::stderr(), "error: no such mailbox '{name}'")?;
                std::process::exit(1);
            }
        }
    }

    let mut remote = Vec::new();
    for raw in &args.remote {
        match Address::parse(raw) {
            Some(address) => remote.push(address),
            None => {
                writeln!(io::stderr(), "error: unparsable recipient '{raw}'")?;
                std::process::exit(1);
            }
        }
    }

    let mut injector = Injector::new(Arc::clone(&runtime), message);
    injector.set_mailboxes(mailboxes.clone());
    if !args.flags.is_empty() {
        injector.set_flags(args.flags.iter().cloned());
    }
    if !remote.is_empty() {
        injector.set_delivery_addresses(remote);
    }
    if let Some(raw) = &args.sender {
        match Address::parse(raw) {
            Some(sender) => injector.set_sender(sender),
            None => {
                writeln!(io::stderr(), "error: unparsable sender '{raw}'")?;
                std::process::exit(1);
            }
        }
    }

    if let Err(err) = injector.execute().await {
        writeln!(io::stderr(), "error: injection failed: {err}")?;
        std::process::exit(1);
    }

    for mailbox in &mailboxes {
        println!(
            "delivered to {} as uid {} (modseq {})",
            mailbox.name(),
            injector.uid(mailbox.id()),
            injector.modseq(mailbox.id())
        );
    }
    if !args.remote.is_empty() {
        println!(
            "spooled message {} for {} remote recipients",
            injector.message_id(),
            args.remote.len()
        );
    }

    Ok(())
}

//! The message injector.
//!
//! An `Injector` persists one parsed message into a set of mailboxes (and/or
//! the outbound delivery spool) in a single database transaction, allocating
//! a UID and modseq per mailbox and reconciling the shared intern tables on
//! the way. It is single-use: build one, configure it, `execute()` it once.
//!
//! Execution is a state machine. Phases run in a fixed order and each one
//! suspends while its queries are outstanding; a failure in any phase rolls
//! the transaction back and fast-forwards to completion. Announcements to
//! live sessions happen strictly after commit.

mod announce;
mod bodyparts;
mod intern;
mod links;
mod uids;

pub use uids::MailboxTarget;

use crate::error::InjectError;
use crate::inject::bodyparts::PartPlan;
use crate::inject::intern::Savepoints;
use crate::inject::links::Links;
use crate::mailbox::MailboxState;
use crate::model::{Address, Annotation, FieldType, Message, UNKNOWN_FIELD};
use crate::runtime::InjectorRuntime;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const INSERT_MESSAGE: &str =
    "INSERT INTO messages (id, rfc822size) VALUES (DEFAULT, $1) RETURNING id";
const COPY_MAILBOX_MESSAGES: &str =
    "COPY mailbox_messages (mailbox, uid, message, idate, modseq) FROM STDIN WITH BINARY";
const COPY_PART_NUMBERS: &str =
    "COPY part_numbers (message, part, bodypart, bytes, lines) FROM STDIN WITH BINARY";
const COPY_HEADER_FIELDS: &str =
    "COPY header_fields (message, part, position, field, value) FROM STDIN WITH BINARY";
const COPY_ADDRESS_FIELDS: &str =
    "COPY address_fields (message, part, position, field, number, address) FROM STDIN WITH BINARY";
const INSERT_DATE_FIELD: &str = "INSERT INTO date_fields (message, value) VALUES ($1, $2)";
const INSERT_DELIVERY: &str = "INSERT INTO deliveries (sender, message, injected_at, expires_at) \
     VALUES ($1, $2, current_timestamp, current_timestamp + interval '2 days') RETURNING id";
const INSERT_DELIVERY_RECIPIENT: &str =
    "INSERT INTO delivery_recipients (delivery, recipient) VALUES ($1, $2)";
const INSERT_FLAG: &str = "INSERT INTO flags (mailbox, uid, flag) VALUES ($1, $2, $3)";
const INSERT_ANNOTATION: &str =
    "INSERT INTO annotations (mailbox, uid, name, value, owner) VALUES ($1, $2, $3, $4, $5)";
const INSERT_UNPARSED: &str = "INSERT INTO unparsed_messages (bodypart) VALUES ($1)";

/// Injection phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Inactive,
    CreatingFlags,
    CreatingAnnotationNames,
    CreatingFields,
    InsertingBodyparts,
    InsertingAddresses,
    SelectingUids,
    InsertingMessages,
    LinkingAddresses,
    LinkingFlags,
    LinkingAnnotations,
    AwaitingCompletion,
    Done,
}

impl State {
    fn next(self) -> State {
        match self {
            State::Inactive => State::CreatingFlags,
            State::CreatingFlags => State::CreatingAnnotationNames,
            State::CreatingAnnotationNames => State::CreatingFields,
            State::CreatingFields => State::InsertingBodyparts,
            State::InsertingBodyparts => State::InsertingAddresses,
            State::InsertingAddresses => State::SelectingUids,
            State::SelectingUids => State::InsertingMessages,
            State::InsertingMessages => State::LinkingAddresses,
            State::LinkingAddresses => State::LinkingFlags,
            State::LinkingFlags => State::LinkingAnnotations,
            State::LinkingAnnotations => State::AwaitingCompletion,
            State::AwaitingCompletion | State::Done => State::Done,
        }
    }
}

/// Injects one message into a list of mailboxes.
///
/// The mailbox list must be known before `execute()`; it is kept sorted by
/// mailbox id so concurrent injectors acquire their row locks in the same
/// order.
pub struct Injector {
    runtime: Arc<InjectorRuntime>,
    message: Message,
    state: State,
    failed: bool,

    targets: Vec<MailboxTarget>,
    flags: Vec<String>,
    annotations: Vec<Annotation>,
    remote_recipients: Vec<Address>,
    sender: Option<Address>,
    wrapped: bool,

    message_id: i32,
    links: Links,
    part_plans: Vec<PartPlan>,
    address_ids: HashMap<String, i32>,
    savepoints: Savepoints,

    validation_error: Option<String>,
    bodypart_error: Option<String>,
    db_error: Option<String>,
}

impl Injector {
    pub fn new(runtime: Arc<InjectorRuntime>, message: Message) -> Self {
        Self {
            runtime,
            message,
            state: State::Inactive,
            failed: false,
            targets: Vec::new(),
            flags: Vec::new(),
            annotations: Vec::new(),
            remote_recipients: Vec::new(),
            sender: None,
            wrapped: false,
            message_id: 0,
            links: Links::default(),
            part_plans: Vec::new(),
            address_ids: HashMap::new(),
            savepoints: Savepoints::default(),
            validation_error: None,
            bodypart_error: None,
            db_error: None,
        }
    }

    /// Set the target mailboxes. The list is sorted by id and deduplicated;
    /// sorted order is what keeps concurrent injectors deadlock-free.
    pub fn set_mailboxes(&mut self, mut mailboxes: Vec<Arc<MailboxState>>) {
        mailboxes.sort_by_key(|m| m.id());
        mailboxes.dedup_by_key(|m| m.id());
        self.targets = mailboxes.into_iter().map(MailboxTarget::new).collect();
    }

    /// Convenience for the single-mailbox case.
    pub fn set_mailbox(&mut self, mailbox: Arc<MailboxState>) {
        self.set_mailboxes(vec![mailbox]);
    }

    /// Set the IMAP flags to attach to the message in every target mailbox.
    /// Duplicate names (case-insensitively) are dropped.
    pub fn set_flags<I, S>(&mut self, flags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        for flag in flags {
            let flag = flag.into();
            if seen.insert(flag.to_lowercase()) {
                self.flags.push(flag);
            }
        }
    }

    /// Set annotations to create on the message. A later entry with the
    /// same owner and entry name replaces the earlier value.
    pub fn set_annotations(&mut self, annotations: &[Annotation]) {
        for annotation in annotations {
            match self.annotations.iter_mut().find(|a| {
                a.owner == annotation.owner && a.entry_name == annotation.entry_name
            }) {
                Some(existing) => existing.value = annotation.value.clone(),
                None => self.annotations.push(annotation.clone()),
            }
        }
    }

    /// Spool the message for later SMTP delivery to these addresses.
    pub fn set_delivery_addresses(&mut self, addresses: Vec<Address>) {
        if !addresses.is_empty() {
            self.remote_recipients = addresses;
        }
    }

    /// Set the envelope sender recorded in `deliveries`.
    pub fn set_sender(&mut self, sender: Address) {
        self.sender = Some(sender);
    }

    /// Mark this as a wrapper around an unparsable original; the second
    /// body part (the original's raw bytes) is recorded in
    /// `unparsed_messages`.
    pub fn set_wrapped(&mut self) {
        self.wrapped = true;
    }

    /// Run the injection to completion: one transaction, commit, announce.
    pub async fn execute(&mut self) -> Result<(), InjectError> {
        if self.state != State::Inactive {
            return Err(InjectError::InvalidInput(
                "injector is single-use".to_string(),
            ));
        }

        if let Err(reason) = self.validate() {
            self.validation_error = Some(reason.clone());
            self.finish_failed();
            return Err(InjectError::InvalidInput(reason));
        }

        self.log_message_details();

        let mut tx = match self.runtime.pool().begin().await {
            Ok(tx) => tx,
            Err(err) => {
                let err = InjectError::from_sqlx(err);
                self.db_error = Some(err.to_string());
                self.finish_failed();
                return Err(err);
            }
        };

        match self.run(&mut tx).await {
            Ok(()) => {
                self.state = State::AwaitingCompletion;
                if let Err(err) = tx.commit().await {
                    let err = InjectError::from_sqlx(err);
                    self.db_error = Some(err.to_string());
                    self.finish_failed();
                    return Err(err);
                }
                announce::announce(&self.runtime, &self.targets);
                self.runtime.tick_injected();
                self.state = State::Done;
                log::info!("injection succeeded: message {}", self.message_id);
                Ok(())
            }
            Err(err) => {
                self.state = State::AwaitingCompletion;
                // The transaction is already doomed; rollback errors add
                // nothing.
                let _ = tx.rollback().await;
                self.finish_failed();
                Err(err)
            }
        }
    }

    /// Advance through the phases until the last pre-commit phase is done.
    async fn run(&mut self, tx: &mut Transaction<'_, Postgres>) -> Result<(), InjectError> {
        while self.state < State::LinkingAnnotations {
            self.state = self.state.next();
            log::trace!("injector phase: {:?}", self.state);

            let step = match self.state {
                State::CreatingFlags => self.create_flags(tx).await,
                State::CreatingAnnotationNames => self.create_annotation_names(tx).await,
                State::CreatingFields => self.create_fields(tx).await,
                State::InsertingBodyparts => self.insert_bodyparts(tx).await,
                State::InsertingAddresses => self.insert_addresses(tx).await,
                State::SelectingUids => self.select_uids(tx).await,
                State::InsertingMessages => self.insert_messages(tx).await,
                State::LinkingAddresses => self.link_addresses(tx).await,
                State::LinkingFlags => self.link_flags(tx).await,
                State::LinkingAnnotations => self.link_annotations(tx).await,
                _ => Ok(()),
            };

            if let Err(err) = step {
                let text = err.to_string();
                if self.state == State::InsertingBodyparts {
                    self.bodypart_error = Some(text);
                } else {
                    self.db_error = Some(text);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), String> {
        if !self.message.valid() {
            return Err(self
                .message
                .error
                .clone()
                .unwrap_or_else(|| "message failed validation".to_string()));
        }
        if self.targets.is_empty() && self.remote_recipients.is_empty() {
            return Err("message has neither mailboxes nor remote recipients".to_string());
        }
        if !self.remote_recipients.is_empty() && self.sender.is_none() {
            return Err("remote delivery requires a sender".to_string());
        }
        Ok(())
    }

    fn finish_failed(&mut self) {
        self.failed = true;
        self.state = State::Done;
        self.runtime.tick_errors();
        log::info!("injection failed: {}", self.error());
    }

    fn log_message_details(&self) {
        let id = self.message.header.message_id();
        if id.is_none() {
            log::debug!("injecting message without message-id");
        }
        for target in &self.targets {
            match id {
                Some(id) => log::info!(
                    "injecting message {} into mailbox {}",
                    id,
                    target.mailbox.name()
                ),
                None => log::info!("injecting message into mailbox {}", target.mailbox.name()),
            }
        }
    }

    async fn create_flags(&mut self, tx: &mut Transaction<'_, Postgres>) -> Result<(), InjectError> {
        let unknown: Vec<String> = self
            .flags
            .iter()
            .filter(|f| self.runtime.flag_names.translate(&f.to_lowercase()).is_none())
            .cloned()
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }
        intern::resolve_names(
            tx,
            &mut self.savepoints,
            &intern::FLAG_NAMES,
            &unknown,
            &self.runtime.flag_names,
        )
        .await
        .map_err(InjectError::from_sqlx)
    }

    async fn create_annotation_names(
        &mut self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), InjectError> {
        let unknown: Vec<String> = self
            .annotations
            .iter()
            .map(|a| a.entry_name.clone())
            .filter(|n| self.runtime.annotation_names.translate(n).is_none())
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }
        intern::resolve_names(
            tx,
            &mut self.savepoints,
            &intern::ANNOTATION_NAMES,
            &unknown,
            &self.runtime.annotation_names,
        )
        .await
        .map_err(InjectError::from_sqlx)
    }

    async fn create_fields(
        &mut self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), InjectError> {
        self.links = links::build(&self.message);

        let mut seen = HashSet::new();
        let unknown: Vec<String> = self
            .links
            .other_fields
            .iter()
            .filter(|n| seen.insert((*n).clone()))
            .filter(|n| self.runtime.field_names.translate(n).is_none())
            .cloned()
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }
        intern::resolve_names(
            tx,
            &mut self.savepoints,
            &intern::FIELD_NAMES,
            &unknown,
            &self.runtime.field_names,
        )
        .await
        .map_err(InjectError::from_sqlx)
    }

    async fn insert_bodyparts(
        &mut self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), InjectError> {
        self.part_plans = bodyparts::plan(&self.message);
        bodyparts::store(tx, &mut self.savepoints, &mut self.part_plans)
            .await
            .map_err(InjectError::from_sqlx)
    }

    async fn insert_addresses(
        &mut self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), InjectError> {
        let mut unique: HashMap<String, Address> = HashMap::new();
        let mut naked: HashMap<String, Address> = HashMap::new();

        for link in &self.links.addresses {
            let key = link.address.key();
            if !unique.contains_key(&key) {
                unique.insert(key, link.address.clone());
                naked
                    .entry(link.address.naked())
                    .or_insert_with(|| link.address.clone());
            }
        }

        // Delivery recipients and the sender fold onto a header address
        // with the same bare localpart@domain, so deliveries reference the
        // same row as the header fields.
        for recipient in &mut self.remote_recipients {
            match naked.get(&recipient.naked()) {
                Some(existing) => *recipient = existing.clone(),
                None => {
                    naked.insert(recipient.naked(), recipient.clone());
                    unique.insert(recipient.key(), recipient.clone());
                }
            }
        }
        if let Some(sender) = &mut self.sender {
            match naked.get(&sender.naked()) {
                Some(existing) => *sender = existing.clone(),
                None => {
                    unique.insert(sender.key(), sender.clone());
                }
            }
        }

        let addresses: Vec<Address> = unique.into_values().collect();
        self.address_ids = intern::resolve_addresses(tx, &mut self.savepoints, &addresses)
            .await
            .map_err(InjectError::from_sqlx)?;
        Ok(())
    }

    async fn select_uids(&mut self, tx: &mut Transaction<'_, Postgres>) -> Result<(), InjectError> {
        self.message_id = sqlx::query_scalar(INSERT_MESSAGE)
            .bind(self.message.rfc822_size)
            .fetch_one(&mut **tx)
            .await
            .map_err(InjectError::from_sqlx)?;

        uids::allocate(tx, &mut self.targets)
            .await
            .map_err(InjectError::from_sqlx)
    }

    async fn insert_messages(
        &mut self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), InjectError> {
        let idate = self.internal_date();

        if !self.targets.is_empty() {
            let mut writer = crate::db::copy::CopyWriter::new(5);
            for target in &self.targets {
                writer.begin_row();
                writer.int4(target.mailbox.id());
                writer.int4(target.uid);
                writer.int4(self.message_id);
                writer.timestamptz(idate);
                writer.int8(target.modseq);
                writer.end_row();
            }
            intern::stream_copy(tx, COPY_MAILBOX_MESSAGES, writer)
                .await
                .map_err(InjectError::from_sqlx)?;
        }

        // One row for the whole message, one per part, one extra per
        // nested message/rfc822.
        let mut writer = crate::db::copy::CopyWriter::new(5);
        writer.begin_row();
        writer.int4(self.message_id);
        writer.text("");
        writer.null();
        writer.null();
        writer.null();
        writer.end_row();
        for plan in &self.part_plans {
            for suffix in ["", ".rfc822"] {
                if suffix == ".rfc822" && !plan.has_nested {
                    continue;
                }
                writer.begin_row();
                writer.int4(self.message_id);
                writer.text(&format!("{}{}", plan.part_number, suffix));
                match plan.id {
                    Some(id) => writer.int4(id),
                    None => writer.null(),
                }
                writer.int4(plan.encoded_bytes);
                writer.int4(plan.encoded_lines);
                writer.end_row();
            }
        }
        intern::stream_copy(tx, COPY_PART_NUMBERS, writer)
            .await
            .map_err(InjectError::from_sqlx)?;

        if !self.links.fields.is_empty() {
            let mut writer = crate::db::copy::CopyWriter::new(5);
            for link in &self.links.fields {
                writer.begin_row();
                writer.int4(self.message_id);
                writer.text(&link.part);
                writer.int4(link.position);
                writer.int4(self.field_id(&link.name, link.field_type));
                writer.text(&link.value);
                writer.end_row();
            }
            intern::stream_copy(tx, COPY_HEADER_FIELDS, writer)
                .await
                .map_err(InjectError::from_sqlx)?;
        }

        for date in &self.links.dates {
            sqlx::query(INSERT_DATE_FIELD)
                .bind(self.message_id)
                .bind(date.value)
                .execute(&mut **tx)
                .await
                .map_err(InjectError::from_sqlx)?;
        }

        self.insert_deliveries(tx).await
    }

    async fn insert_deliveries(
        &mut self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), InjectError> {
        if self.remote_recipients.is_empty() {
            return Ok(());
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| InjectError::InvalidInput("remote delivery requires a sender".into()))?;
        let sender_id = self.resolved_address(sender)?;

        log::info!(
            "spooling message {} for delivery to {} remote recipients",
            self.message_id,
            self.remote_recipients.len()
        );

        let delivery_id: i32 = sqlx::query_scalar(INSERT_DELIVERY)
            .bind(sender_id)
            .bind(self.message_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(InjectError::from_sqlx)?;

        for recipient in &self.remote_recipients {
            let recipient_id = match self.address_ids.get(&recipient.key()) {
                Some(id) => *id,
                None => {
                    return Err(InjectError::Internal(format!(
                        "recipient {} was not interned",
                        recipient
                    )))
                }
            };
            sqlx::query(INSERT_DELIVERY_RECIPIENT)
                .bind(delivery_id)
                .bind(recipient_id)
                .execute(&mut **tx)
                .await
                .map_err(InjectError::from_sqlx)?;
        }
        Ok(())
    }

    async fn link_addresses(
        &mut self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), InjectError> {
        if self.links.addresses.is_empty() {
            return Ok(());
        }
        let mut writer = crate::db::copy::CopyWriter::new(6);
        for link in &self.links.addresses {
            let address_id = self.resolved_address(&link.address)?;
            writer.begin_row();
            writer.int4(self.message_id);
            writer.text(&link.part);
            writer.int4(link.position);
            writer.int4(link.field_type.id());
            writer.int4(link.number);
            writer.int4(address_id);
            writer.end_row();
        }
        intern::stream_copy(tx, COPY_ADDRESS_FIELDS, writer)
            .await
            .map_err(InjectError::from_sqlx)?;
        Ok(())
    }

    async fn link_flags(&mut self, tx: &mut Transaction<'_, Postgres>) -> Result<(), InjectError> {
        for flag in &self.flags {
            let flag_id = self
                .runtime
                .flag_names
                .translate(&flag.to_lowercase())
                .ok_or_else(|| {
                    InjectError::Internal(format!("flag {} was not interned", flag))
                })?;
            for target in &self.targets {
                sqlx::query(INSERT_FLAG)
                    .bind(target.mailbox.id())
                    .bind(target.uid)
                    .bind(flag_id)
                    .execute(&mut **tx)
                    .await
                    .map_err(InjectError::from_sqlx)?;
            }
        }
        Ok(())
    }

    async fn link_annotations(
        &mut self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), InjectError> {
        for annotation in &self.annotations {
            let name_id = self
                .runtime
                .annotation_names
                .translate(&annotation.entry_name)
                .ok_or_else(|| {
                    InjectError::Internal(format!(
                        "annotation {} was not interned",
                        annotation.entry_name
                    ))
                })?;
            for target in &self.targets {
                sqlx::query(INSERT_ANNOTATION)
                    .bind(target.mailbox.id())
                    .bind(target.uid)
                    .bind(name_id)
                    .bind(&annotation.value)
                    .bind(annotation.owner)
                    .execute(&mut **tx)
                    .await
                    .map_err(InjectError::from_sqlx)?;
            }
        }

        self.handle_wrapping(tx).await
    }

    async fn handle_wrapping(
        &mut self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), InjectError> {
        if !self.wrapped {
            return Ok(());
        }
        match self
            .part_plans
            .iter()
            .find(|p| p.part_number == "2")
            .and_then(|p| p.id)
        {
            Some(bodypart_id) => {
                sqlx::query(INSERT_UNPARSED)
                    .bind(bodypart_id)
                    .execute(&mut **tx)
                    .await
                    .map_err(InjectError::from_sqlx)?;
            }
            None => log::warn!("wrapped message has no stored part 2"),
        }
        Ok(())
    }

    /// `header_fields.field`: the interned name id when known, the built-in
    /// type id for typed fields, and the reserved `Unknown` id otherwise.
    fn field_id(&self, name: &str, field_type: FieldType) -> i32 {
        if let Some(id) = self.runtime.field_names.translate(name) {
            return id;
        }
        if field_type != FieldType::Other {
            field_type.id()
        } else {
            UNKNOWN_FIELD
        }
    }

    fn resolved_address(&self, address: &Address) -> Result<i32, InjectError> {
        self.address_ids.get(&address.key()).copied().ok_or_else(|| {
            InjectError::Internal(format!("address {} was not interned", address))
        })
    }

    /// A plausible IMAP internal date: the ingested one when present, else
    /// the timestamp of the newest Received hop, else the Date header, else
    /// now.
    fn internal_date(&self) -> DateTime<Utc> {
        if let Some(date) = self.message.internal_date {
            return date;
        }

        for field in self.message.header.fields() {
            if field.field_type == FieldType::Received {
                if let Some((_, stamp)) = field.value.rsplit_once(';') {
                    if let Some(date) = links::parse_date(stamp) {
                        return date;
                    }
                }
            }
        }

        if let Some(field) = self.message.header.field(FieldType::Date) {
            if let Some(date) = links::parse_date(&field.value) {
                return date;
            }
        }

        Utc::now()
    }

    /// True once the injector has finished, successfully or not.
    pub fn done(&self) -> bool {
        self.failed || self.state == State::Done
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Human-readable failure reason, from the first offending
    /// sub-component: validation, then bodyparts, then the transaction.
    pub fn error(&self) -> String {
        if !self.failed {
            return String::new();
        }
        self.validation_error
            .clone()
            .or_else(|| self.bodypart_error.clone())
            .or_else(|| self.db_error.clone())
            .unwrap_or_default()
    }

    /// The UID assigned in `mailbox`, or 0 if none has been selected (yet).
    pub fn uid(&self, mailbox_id: i32) -> i32 {
        self.targets
            .iter()
            .find(|t| t.mailbox.id() == mailbox_id)
            .map(|t| t.uid)
            .unwrap_or(0)
    }

    /// The modseq assigned in `mailbox`, with the same caveats as `uid()`.
    pub fn modseq(&self, mailbox_id: i32) -> i64 {
        self.targets
            .iter()
            .find(|t| t.mailbox.id() == mailbox_id)
            .map(|t| t.modseq)
            .unwrap_or(0)
    }

    /// The `messages.id` of the injected row; 0 until UID selection.
    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn mailboxes(&self) -> Vec<Arc<MailboxState>> {
        self.targets.iter().map(|t| t.mailbox.clone()).collect()
    }

    pub fn state(&self) -> State {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Header;

    fn runtime() -> Arc<InjectorRuntime> {
        InjectorRuntime::new(
            sqlx::postgres::PgPoolOptions::new()
                .max_connections(1)
                .connect_lazy("postgres://localhost/unused")
                .expect("lazy pool"),
        )
    }

    fn message_with_header(build: impl FnOnce(&mut Header)) -> Message {
        let mut message = Message::default();
        build(&mut message.header);
        message
    }

    #[test]
    fn state_order_is_fixed() {
        let mut state = State::Inactive;
        let mut seen = vec![state];
        while state != State::Done {
            state = state.next();
            seen.push(state);
        }
        assert_eq!(seen.len(), 13);
        assert!(State::SelectingUids < State::InsertingMessages);
    }

    #[tokio::test]
    async fn set_flags_dedups_case_insensitively() {
        let mut injector = Injector::new(runtime(), Message::default());
        injector.set_flags(["\\Seen", "\\seen", "\\Flagged"]);
        assert_eq!(injector.flags, vec!["\\Seen", "\\Flagged"]);
    }

    #[tokio::test]
    async fn set_annotations_replaces_same_entry() {
        let mut injector = Injector::new(runtime(), Message::default());
        injector.set_annotations(&[
            Annotation::new("/comment", "one", None),
            Annotation::new("/comment", "two", None),
            Annotation::new("/comment", "mine", Some(3)),
        ]);
        assert_eq!(injector.annotations.len(), 2);
        assert_eq!(injector.annotations[0].value, "two");
    }

    #[tokio::test]
    async fn set_mailboxes_sorts_and_dedups() {
        let mut injector = Injector::new(runtime(), Message::default());
        let a = MailboxState::new(3, "c", 1, 1, 1);
        let b = MailboxState::new(1, "a", 1, 1, 1);
        injector.set_mailboxes(vec![a.clone(), b, a]);
        let ids: Vec<i32> = injector.targets.iter().map(|t| t.mailbox.id()).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn validation_requires_a_destination() {
        let mut injector = Injector::new(runtime(), Message::default());
        assert!(injector.validate().is_err());
        injector.set_mailbox(MailboxState::new(1, "INBOX", 1, 1, 1));
        assert!(injector.validate().is_ok());
    }

    #[tokio::test]
    async fn validation_requires_sender_for_remote() {
        let mut injector = Injector::new(runtime(), Message::default());
        injector.set_delivery_addresses(vec![Address::new("", "r", "remote.example")]);
        assert!(injector.validate().is_err());
        injector.set_sender(Address::new("", "s", "here.example"));
        assert!(injector.validate().is_ok());
    }

    #[tokio::test]
    async fn invalid_message_is_refused() {
        let mut message = Message::default();
        message.error = Some("bad header".to_string());
        let mut injector = Injector::new(runtime(), message);
        injector.set_mailbox(MailboxState::new(1, "INBOX", 1, 1, 1));
        assert_eq!(injector.validate(), Err("bad header".to_string()));
    }

    #[tokio::test]
    async fn internal_date_prefers_received_then_date() {
        let rt = runtime();

        let msg = message_with_header(|h| {
            h.add(
                "Received",
                "from relay by mx; Mon, 5 Jan 2026 10:00:00 +0000",
            );
            h.add("Date", "Sun, 4 Jan 2026 09:00:00 +0000");
        });
        let injector = Injector::new(rt.clone(), msg);
        assert_eq!(
            injector.internal_date().to_rfc2822(),
            "Mon, 5 Jan 2026 10:00:00 +0000"
        );

        let msg = message_with_header(|h| {
            h.add("Date", "Sun, 4 Jan 2026 09:00:00 +0000");
        });
        let injector = Injector::new(rt.clone(), msg);
        assert_eq!(
            injector.internal_date().to_rfc2822(),
            "Sun, 4 Jan 2026 09:00:00 +0000"
        );

        // Unparsable everything falls back to the clock.
        let injector = Injector::new(rt, message_with_header(|h| h.add("Date", "nonsense")));
        let now = Utc::now();
        let derived = injector.internal_date();
        assert!((derived - now).num_seconds().abs() < 5);
    }

    #[tokio::test]
    async fn field_id_falls_back_to_type_then_unknown() {
        let rt = runtime();
        let injector = Injector::new(rt.clone(), Message::default());
        assert_eq!(
            injector.field_id("Subject", FieldType::Subject),
            FieldType::Subject.id()
        );
        assert_eq!(injector.field_id("X-Novel", FieldType::Other), UNKNOWN_FIELD);
        rt.field_names.insert("X-Novel".to_string(), 77);
        assert_eq!(injector.field_id("X-Novel", FieldType::Other), 77);
    }

    #[tokio::test]
    async fn accessors_before_allocation_return_zero() {
        let mut injector = Injector::new(runtime(), Message::default());
        injector.set_mailbox(MailboxState::new(5, "INBOX", 1, 1, 1));
        assert_eq!(injector.uid(5), 0);
        assert_eq!(injector.modseq(5), 0);
        assert_eq!(injector.uid(99), 0);
        assert!(!injector.done());
        assert!(!injector.failed());
        assert_eq!(injector.error(), "");
    }
}

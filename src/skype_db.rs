//! Change streams over a Skype-style `main.db`.
//!
//! Table schema (subset read here):
//! ```sql
//! CREATE TABLE Conversations (
//!     id INTEGER NOT NULL PRIMARY KEY, identity TEXT, type INTEGER,
//!     displayname TEXT, given_displayname TEXT, creator TEXT,
//!     creation_timestamp INTEGER, last_activity_timestamp INTEGER,
//!     is_bookmarked INTEGER, is_blocked INTEGER, meta_topic TEXT,
//!     dialog_partner TEXT, ...
//! );
//! CREATE TABLE Messages (
//!     id INTEGER NOT NULL PRIMARY KEY, convo_id INTEGER, chatname TEXT,
//!     author TEXT, from_dispname TEXT, timestamp INTEGER,
//!     edited_timestamp INTEGER, type INTEGER, chatmsg_type INTEGER,
//!     body_xml TEXT, ...
//! );
//! ```
//! Rows are append-only with increasing ids, so each stream polls for ids
//! above the last one it emitted.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat};
use rusqlite::{Connection, OpenFlags, Row};
use tracing::{debug, warn};

use crate::adapter::ChatDbAdapter;
use crate::error::StreamError;
use crate::stream::{CsvRecord, RecordSender, RecordStream, record_channel};

const BATCH_SIZE: i64 = 500;

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    /// Emit rows that existed before the subscription, not just new ones.
    pub from_beginning: bool,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            from_beginning: false,
        }
    }
}

/// A table polled by id watermark.
trait PolledTable: Sized + Send + 'static {
    const TABLE: &'static str;
    const COLUMNS: &'static str;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
    fn id(&self) -> i64;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    pub id: i64,
    pub identity: Option<String>,
    pub kind: Option<i64>,
    pub display_name: Option<String>,
    pub given_display_name: Option<String>,
    pub creator: Option<String>,
    pub creation_timestamp: Option<i64>,
    pub last_activity_timestamp: Option<i64>,
    pub is_bookmarked: Option<i64>,
    pub is_blocked: Option<i64>,
    pub topic: Option<String>,
    pub dialog_partner: Option<String>,
}

impl PolledTable for Conversation {
    const TABLE: &'static str = "Conversations";
    const COLUMNS: &'static str = "id, identity, type, displayname, given_displayname, creator, \
         creation_timestamp, last_activity_timestamp, is_bookmarked, is_blocked, meta_topic, \
         dialog_partner";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identity: row.get(1)?,
            kind: row.get(2)?,
            display_name: row.get(3)?,
            given_display_name: row.get(4)?,
            creator: row.get(5)?,
            creation_timestamp: row.get(6)?,
            last_activity_timestamp: row.get(7)?,
            is_bookmarked: row.get(8)?,
            is_blocked: row.get(9)?,
            topic: row.get(10)?,
            dialog_partner: row.get(11)?,
        })
    }

    fn id(&self) -> i64 {
        self.id
    }
}

impl CsvRecord for Conversation {
    fn build_csv(&self, out: &mut String) {
        let mut row = CsvLine::new(out);
        row.int(Some(self.id));
        row.text(self.identity.as_deref());
        row.int(self.kind);
        row.text(self.display_name.as_deref());
        row.text(self.given_display_name.as_deref());
        row.text(self.creator.as_deref());
        row.timestamp(self.creation_timestamp);
        row.timestamp(self.last_activity_timestamp);
        row.int(self.is_bookmarked);
        row.int(self.is_blocked);
        row.text(self.topic.as_deref());
        row.text(self.dialog_partner.as_deref());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: i64,
    pub convo_id: Option<i64>,
    pub chat_name: Option<String>,
    pub author: Option<String>,
    pub from_display_name: Option<String>,
    pub timestamp: Option<i64>,
    pub edited_timestamp: Option<i64>,
    pub kind: Option<i64>,
    pub chat_message_kind: Option<i64>,
    pub body: Option<String>,
}

impl PolledTable for ChatMessage {
    const TABLE: &'static str = "Messages";
    const COLUMNS: &'static str = "id, convo_id, chatname, author, from_dispname, timestamp, \
         edited_timestamp, type, chatmsg_type, body_xml";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            convo_id: row.get(1)?,
            chat_name: row.get(2)?,
            author: row.get(3)?,
            from_display_name: row.get(4)?,
            timestamp: row.get(5)?,
            edited_timestamp: row.get(6)?,
            kind: row.get(7)?,
            chat_message_kind: row.get(8)?,
            body: row.get(9)?,
        })
    }

    fn id(&self) -> i64 {
        self.id
    }
}

impl CsvRecord for ChatMessage {
    fn build_csv(&self, out: &mut String) {
        let mut row = CsvLine::new(out);
        row.timestamp(self.timestamp);
        row.int(Some(self.id));
        row.int(self.convo_id);
        row.text(self.chat_name.as_deref());
        row.text(self.author.as_deref());
        row.text(self.from_display_name.as_deref());
        row.timestamp(self.edited_timestamp);
        row.int(self.kind);
        row.int(self.chat_message_kind);
        row.text(self.body.as_deref());
    }
}

/// Writes comma separated fields into a single line.
struct CsvLine<'a> {
    out: &'a mut String,
    first: bool,
}

impl<'a> CsvLine<'a> {
    fn new(out: &'a mut String) -> Self {
        Self { out, first: true }
    }

    fn separator(&mut self) {
        if !self.first {
            self.out.push(',');
        }
        self.first = false;
    }

    fn int(&mut self, value: Option<i64>) {
        self.separator();
        if let Some(v) = value {
            self.out.push_str(&v.to_string());
        }
    }

    fn timestamp(&mut self, value: Option<i64>) {
        self.separator();
        if let Some(dt) = value.and_then(|secs| DateTime::from_timestamp(secs, 0)) {
            self.out
                .push_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
    }

    fn text(&mut self, value: Option<&str>) {
        self.separator();
        let Some(value) = value else {
            return;
        };
        // Records must stay on one line.
        let value = value.replace(['\r', '\n'], " ");
        if value.contains([',', '"']) {
            self.out.push('"');
            self.out.push_str(&value.replace('"', "\"\""));
            self.out.push('"');
        } else {
            self.out.push_str(&value);
        }
    }
}

fn open_db(path: &Path) -> Result<Connection, StreamError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    // The chat client keeps the database open and writes to it while we read.
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/// Polling [`ChatDbAdapter`] for the chat client's SQLite database.
#[derive(Debug, Default)]
pub struct SkypeDb {
    path: Option<PathBuf>,
    options: PollOptions,
}

impl SkypeDb {
    pub fn new(options: PollOptions) -> Self {
        Self {
            path: None,
            options,
        }
    }

    fn spawn_poller<T: PolledTable>(&self) -> Result<RecordStream<T>, StreamError> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| StreamError::Open("no database path set".to_string()))?;
        let conn = open_db(path)?;
        let watermark = if self.options.from_beginning {
            0
        } else {
            conn.query_row(
                &format!("SELECT COALESCE(MAX(id), 0) FROM {}", T::TABLE),
                [],
                |row| row.get(0),
            )?
        };

        let (sender, stream) = record_channel();
        let interval = self.options.interval;
        // Joined on cancel, so the database is closed before the share goes away.
        let poller = thread::Builder::new()
            .name(format!("poll-{}", T::TABLE.to_lowercase()))
            .spawn(move || poll_table::<T>(conn, watermark, interval, sender))
            .map_err(StreamError::Spawn)?;
        Ok(stream.with_producer(poller))
    }
}

impl ChatDbAdapter for SkypeDb {
    type Conversation = Conversation;
    type Message = ChatMessage;

    fn set_connection(&mut self, path: &str) -> Result<(), StreamError> {
        if path.trim().is_empty() {
            return Err(StreamError::Open("empty database path".to_string()));
        }
        self.path = Some(PathBuf::from(path));
        Ok(())
    }

    fn conversations(&mut self) -> Result<RecordStream<Conversation>, StreamError> {
        self.spawn_poller()
    }

    fn messages(&mut self) -> Result<RecordStream<ChatMessage>, StreamError> {
        self.spawn_poller()
    }
}

fn fetch_after<T: PolledTable>(conn: &Connection, watermark: i64) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM {} WHERE id > ?1 ORDER BY id LIMIT ?2",
        T::COLUMNS,
        T::TABLE
    ))?;
    stmt.query_map([watermark, BATCH_SIZE], T::from_row)?
        .collect()
}

fn poll_table<T: PolledTable>(
    conn: Connection,
    mut watermark: i64,
    interval: Duration,
    sender: RecordSender<T>,
) {
    debug!(table = T::TABLE, watermark, "Polling started");
    loop {
        let batch = match fetch_after::<T>(&conn, watermark) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(table = T::TABLE, error = %e, "Polling failed");
                sender.fail(StreamError::Database(e));
                return;
            }
        };
        let full = batch.len() as i64 == BATCH_SIZE;
        for record in batch {
            watermark = record.id();
            if !sender.send(record) {
                return;
            }
        }
        if !full && sender.wait_closed(interval) {
            debug!(table = T::TABLE, watermark, "Polling stopped");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn create_db(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE Conversations (
                id INTEGER NOT NULL PRIMARY KEY, identity TEXT, type INTEGER,
                displayname TEXT, given_displayname TEXT, creator TEXT,
                creation_timestamp INTEGER, last_activity_timestamp INTEGER,
                is_bookmarked INTEGER, is_blocked INTEGER, meta_topic TEXT,
                dialog_partner TEXT);
             CREATE TABLE Messages (
                id INTEGER NOT NULL PRIMARY KEY, convo_id INTEGER, chatname TEXT,
                author TEXT, from_dispname TEXT, timestamp INTEGER,
                edited_timestamp INTEGER, type INTEGER, chatmsg_type INTEGER,
                body_xml TEXT);",
        )
        .unwrap();
        conn
    }

    fn insert_message(conn: &Connection, id: i64, author: &str, body: &str) {
        conn.execute(
            "INSERT INTO Messages (id, convo_id, author, timestamp, body_xml)
             VALUES (?1, 1, ?2, 1609459200, ?3)",
            rusqlite::params![id, author, body],
        )
        .unwrap();
    }

    fn adapter(path: &Path, from_beginning: bool) -> SkypeDb {
        let mut db = SkypeDb::new(PollOptions {
            interval: Duration::from_millis(10),
            from_beginning,
        });
        db.set_connection(path.to_str().unwrap()).unwrap();
        db
    }

    #[test]
    fn message_renders_as_one_csv_line() {
        let msg = ChatMessage {
            id: 7,
            convo_id: Some(1),
            author: Some("alice".into()),
            timestamp: Some(1_609_459_200),
            body: Some("hi, \"bob\"\nsecond line".into()),
            ..Default::default()
        };
        let mut line = String::new();
        msg.build_csv(&mut line);
        assert_eq!(
            line,
            "2021-01-01T00:00:00Z,7,1,,alice,,,,,\"hi, \"\"bob\"\" second line\""
        );
    }

    #[test]
    fn conversation_leaves_missing_fields_empty() {
        let convo = Conversation {
            id: 3,
            identity: Some("bob".into()),
            ..Default::default()
        };
        let mut line = String::new();
        convo.build_csv(&mut line);
        assert_eq!(line, "3,bob,,,,,,,,,,");
    }

    #[test]
    fn streams_existing_rows_from_the_beginning_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.db");
        let conn = create_db(&path);
        insert_message(&conn, 2, "bob", "second");
        insert_message(&conn, 1, "alice", "first");

        let mut db = adapter(&path, true);
        let (tx, rx) = unbounded();
        let _sub = db
            .messages()
            .unwrap()
            .subscribe("messages", move |m: ChatMessage| tx.send(m).unwrap(), |_| {})
            .unwrap();

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(first.body.as_deref(), Some("first"));
    }

    #[test]
    fn only_new_rows_are_emitted_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.db");
        let conn = create_db(&path);
        insert_message(&conn, 1, "alice", "old");

        let mut db = adapter(&path, false);
        let (tx, rx) = unbounded();
        let _sub = db
            .messages()
            .unwrap()
            .subscribe("messages", move |m: ChatMessage| tx.send(m).unwrap(), |_| {})
            .unwrap();

        insert_message(&conn, 2, "bob", "new");
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got.id, 2);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn missing_database_fails_at_subscribe_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = adapter(&dir.path().join("absent.db"), false);
        assert!(matches!(db.conversations(), Err(StreamError::Database(_))));
    }

    #[test]
    fn streams_need_a_path_first() {
        let mut db = SkypeDb::default();
        assert!(matches!(db.messages(), Err(StreamError::Open(_))));
        assert!(db.set_connection("  ").is_err());
    }
}

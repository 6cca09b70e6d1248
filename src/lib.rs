//! # remote-chat-backup
//!
//! Keeps a running CSV archive of a chat client's history while the client's
//! database lives on another machine.
//!
//! ## What it does
//!
//! A [`ChangeStreamMonitor`] mounts the remote host's share (`\\host`), points
//! a [`ChatDbAdapter`] at `\\host\<source path>\<file name>`, and subscribes to
//! its two change streams. Every conversation and message the adapter emits is
//! rendered to one CSV line and appended to a local export file:
//!
//! - `<target dir>/<base name>.csv.conversations`
//! - `<target dir>/<base name>.csv.messages`
//!
//! Export files are append-only and are reopened for every record, so they
//! can be tailed or copied while the monitor runs.
//!
//! ## Lifecycle
//!
//! `start()` either fully succeeds or releases whatever it acquired before
//! returning the error. `stop()` cancels both subscriptions before releasing
//! the share and can be called any number of times.
//!
//! The bundled [`SkypeDb`] adapter polls a Skype-style SQLite `main.db` for
//! rows it has not seen yet.

pub mod adapter;
pub mod config;
pub mod error;
pub mod exporter;
pub mod monitor;
pub mod share;
pub mod skype_db;
pub mod stream;

pub use adapter::ChatDbAdapter;
pub use config::{Credential, ExportLayout, MonitorConfig, ResolvedTargets};
pub use error::{ConfigError, ExportError, MonitorError, ShareError, StreamError};
pub use exporter::{ExportLocks, ExportOutcome, ExportStats, IncrementalExporter};
pub use monitor::{ChangeStreamMonitor, EVENT_CAPACITY, MonitorEvent, MonitorState, StreamKind};
pub use share::{
    ConnectionState, MountHandle, PlatformMount, RemoteShareMount, ShareConnection,
    ShareConnector,
};
pub use skype_db::{ChatMessage, Conversation, PollOptions, SkypeDb};
pub use stream::{CsvRecord, RecordSender, RecordStream, StreamEnd, Subscription, record_channel};

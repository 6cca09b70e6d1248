use crate::error::StreamError;
use crate::stream::{CsvRecord, RecordStream};

/// Source of conversation and message change streams for one chat database.
pub trait ChatDbAdapter: Send {
    type Conversation: CsvRecord + Send + 'static;
    type Message: CsvRecord + Send + 'static;

    /// Point the adapter at the database file, e.g. `\\host\share\main.db`.
    fn set_connection(&mut self, path: &str) -> Result<(), StreamError>;

    /// Newly observed conversations, in the order they are observed.
    fn conversations(&mut self) -> Result<RecordStream<Self::Conversation>, StreamError>;

    /// Newly observed messages, in the order they are observed.
    fn messages(&mut self) -> Result<RecordStream<Self::Message>, StreamError>;
}

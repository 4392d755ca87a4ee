//! Incremental request parser and executor.
//!
//! Bytes are scanned one at a time, so a command may arrive split at any
//! point (mid-token, mid-payload) and still parse identically. Whitespace
//! separates tokens, `\n` ends the command line, and the data block of a
//! storage command is read verbatim by length and must be followed by
//! exactly `\r\n`.
//!
//! ```text
//! Command ─┬─ set/add ──> StorageKey > Flags > ExpTime > NBytes > NoReply ─> Data > DataCr > DataLf
//!          ├─ delete ───> DeleteKey ──────────────────────────> NoReply
//!          ├─ get/gets ─> RetrievalKey > RetrievalKeys
//!          └─ ping/quit > LineEnd
//!
//! errors mid-line ─> Swallow (until \n) ─> Finished
//! ```
//!
//! A command is complete in `Finished` (a response is ready) or `Quitting`.
//! [`Request::process`] stops at that point and reports how many bytes it
//! used; anything after belongs to the next command.

use super::{ProtocolError, Response};
use crate::metrics::Metrics;
use crate::store::{Status, Store};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Command,
    DeleteKey,
    StorageKey,
    Flags,
    ExpTime,
    NBytes,
    NoReply,
    /// Reading the data block; at least one byte remains.
    Data,
    /// Data block read, expecting `\r`.
    DataCr,
    /// Expecting the `\n` that ends the data block.
    DataLf,
    RetrievalKey,
    RetrievalKeys,
    /// Only whitespace may follow before the end of the line.
    LineEnd,
    /// Discarding the rest of a rejected command line.
    Swallow,
    Finished,
    Quitting,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Finished | State::Quitting)
    }
}

/// Command named by the first token of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    None,
    Set,
    Add,
    Get,
    Gets,
    Delete,
    Quit,
    Ping,
}

impl Command {
    fn from_token(token: &[u8]) -> Option<Self> {
        match token {
            b"set" => Some(Command::Set),
            b"add" => Some(Command::Add),
            b"get" => Some(Command::Get),
            b"gets" => Some(Command::Gets),
            b"delete" => Some(Command::Delete),
            b"quit" => Some(Command::Quit),
            b"ping" => Some(Command::Ping),
            _ => None,
        }
    }

    /// State that reads this command's first argument.
    fn first_state(self) -> State {
        match self {
            Command::Set | Command::Add => State::StorageKey,
            Command::Get | Command::Gets => State::RetrievalKey,
            Command::Delete => State::DeleteKey,
            Command::Quit | Command::Ping | Command::None => State::LineEnd,
        }
    }
}

/// What one input byte means in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Append to the token being built.
    Accumulate,
    /// Close the current token; the command line continues.
    Delimit,
    /// Close the current token and the command line.
    EndLine,
    /// Append verbatim to the data block.
    Payload,
    /// Expected terminator byte after the data block.
    Terminator,
    /// Anything other than `\r\n` after the data block.
    BadChunk,
    /// Discard while skipping a rejected line.
    Swallow,
    /// The `\n` that ends a rejected line.
    SwallowEnd,
    /// The command is already complete; leave the byte for the next one.
    Halt,
}

fn is_delimiter(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | 0x0b | 0x0c)
}

/// Classify `byte` in `state`. Pure; all side effects happen in
/// [`Request::process`].
pub fn action(state: State, byte: u8) -> Action {
    match state {
        State::Finished | State::Quitting => Action::Halt,
        State::Data => Action::Payload,
        State::DataCr if byte == b'\r' => Action::Terminator,
        State::DataLf if byte == b'\n' => Action::Terminator,
        State::DataCr | State::DataLf => Action::BadChunk,
        State::Swallow if byte == b'\n' => Action::SwallowEnd,
        State::Swallow => Action::Swallow,
        _ if byte == b'\n' => Action::EndLine,
        _ if is_delimiter(byte) => Action::Delimit,
        _ => Action::Accumulate,
    }
}

fn parse_number<T: std::str::FromStr>(
    field: &'static str,
    token: &[u8],
) -> Result<T, ProtocolError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtocolError::InvalidNumber {
            field,
            value: String::from_utf8_lossy(token).into_owned(),
        })
}

/// One in-flight command on a connection. Reused via [`Request::reset`].
pub struct Request {
    store: Option<Arc<dyn Store>>,
    metrics: Arc<dyn Metrics>,
    max_bytes: usize,

    state: State,
    command: Command,
    keys: Vec<Bytes>,
    flags: u32,
    exp_time: i64,
    remaining: usize,
    no_reply: bool,
    buffer: BytesMut,
    processed: usize,
    close_after_response: bool,
    response: BytesMut,
}

impl Request {
    /// Create a request parser.
    ///
    /// `max_bytes` caps how many bytes one command may span; 0 disables the
    /// limit. Without a store every storage command answers with an error.
    pub fn new(
        store: Option<Arc<dyn Store>>,
        metrics: Arc<dyn Metrics>,
        max_bytes: usize,
    ) -> Self {
        Self {
            store,
            metrics,
            max_bytes,
            state: State::Command,
            command: Command::None,
            keys: Vec::new(),
            flags: 0,
            exp_time: 0,
            remaining: 0,
            no_reply: false,
            buffer: BytesMut::new(),
            processed: 0,
            close_after_response: false,
            response: BytesMut::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    #[cfg(test)]
    pub fn command(&self) -> Command {
        self.command
    }

    #[cfg(test)]
    pub fn keys(&self) -> &[Bytes] {
        &self.keys
    }

    #[cfg(test)]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[cfg(test)]
    pub fn exp_time(&self) -> i64 {
        self.exp_time
    }

    pub fn no_reply(&self) -> bool {
        self.no_reply
    }

    /// Current token, or the data block once a storage command is read.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// The stream can no longer be trusted; close after responding.
    pub fn close_after_response(&self) -> bool {
        self.close_after_response
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The response to send. Only available once the command is finished.
    pub fn response(&self) -> Result<&[u8], ProtocolError> {
        if self.state != State::Finished {
            return Err(ProtocolError::NotFinished);
        }
        Ok(&self.response)
    }

    /// Restore the initial state so the next command can be parsed.
    pub fn reset(&mut self) {
        self.state = State::Command;
        self.command = Command::None;
        self.keys.clear();
        self.flags = 0;
        self.exp_time = 0;
        self.remaining = 0;
        self.no_reply = false;
        self.buffer.clear();
        self.processed = 0;
        self.close_after_response = false;
        self.response.clear();
    }

    /// Feed bytes to the parser.
    ///
    /// Returns how many bytes were consumed. This is less than
    /// `input.len()` only when the command reached a terminal state; the
    /// rest belongs to the next command.
    pub fn process(&mut self, input: &[u8]) -> usize {
        let mut consumed = 0;
        for &byte in input {
            if self.state.is_terminal() {
                break;
            }
            if self.max_bytes > 0 && self.processed >= self.max_bytes {
                self.close_after_response = true;
                self.fail(ProtocolError::SizeExceeded, true);
                break;
            }
            self.processed += 1;
            consumed += 1;
            self.step(byte);
        }
        consumed
    }

    fn step(&mut self, byte: u8) {
        match action(self.state, byte) {
            Action::Accumulate => self.buffer.put_u8(byte),
            Action::Payload => {
                self.buffer.put_u8(byte);
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.state = State::DataCr;
                }
            }
            Action::Terminator => {
                if self.state == State::DataCr {
                    self.state = State::DataLf;
                } else {
                    self.prepare_response();
                }
            }
            Action::BadChunk => {
                self.close_after_response = true;
                self.fail(ProtocolError::BadDataChunk, true);
            }
            Action::Delimit => self.on_token(false),
            Action::EndLine => self.on_token(true),
            Action::Swallow => {}
            Action::SwallowEnd => self.state = State::Finished,
            Action::Halt => {}
        }
    }

    fn on_token(&mut self, end_of_line: bool) {
        let result = self.accept_token().and_then(|()| {
            if end_of_line {
                self.end_line()
            } else {
                Ok(())
            }
        });
        if let Err(error) = result {
            self.fail(error, end_of_line);
        }
    }

    /// Interpret the token accumulated since the last delimiter.
    fn accept_token(&mut self) -> Result<(), ProtocolError> {
        let token = self.buffer.split().freeze();
        // Runs of whitespace and blank lines
        if token.is_empty() {
            return Ok(());
        }

        match self.state {
            State::Command => {
                self.command = Command::from_token(&token).ok_or_else(|| {
                    ProtocolError::UnknownCommand(String::from_utf8_lossy(&token).into_owned())
                })?;
                self.state = self.command.first_state();
            }
            State::DeleteKey | State::StorageKey => {
                self.keys.push(token);
                self.state = if self.state == State::StorageKey {
                    State::Flags
                } else {
                    State::NoReply
                };
            }
            State::Flags => {
                self.flags = parse_number("flags", &token)?;
                self.state = State::ExpTime;
            }
            State::ExpTime => {
                self.exp_time = parse_number("exptime", &token)?;
                self.state = State::NBytes;
            }
            State::NBytes => {
                self.remaining = parse_number("bytes", &token)?;
                self.state = State::NoReply;
            }
            State::NoReply => {
                if token.as_ref() != b"noreply" || self.no_reply {
                    return Err(ProtocolError::UnexpectedToken(
                        String::from_utf8_lossy(&token).into_owned(),
                    ));
                }
                self.no_reply = true;
            }
            State::RetrievalKey | State::RetrievalKeys => {
                self.keys.push(token);
                self.state = State::RetrievalKeys;
            }
            State::LineEnd => {
                return Err(ProtocolError::UnexpectedToken(
                    String::from_utf8_lossy(&token).into_owned(),
                ));
            }
            State::Data
            | State::DataCr
            | State::DataLf
            | State::Swallow
            | State::Finished
            | State::Quitting => {}
        }
        Ok(())
    }

    /// The command line ended; decide what comes next.
    fn end_line(&mut self) -> Result<(), ProtocolError> {
        match self.state {
            State::Command => {}
            State::DeleteKey => return Err(ProtocolError::InvalidKey),
            State::StorageKey | State::Flags | State::ExpTime | State::NBytes => {
                return Err(ProtocolError::MissingArguments)
            }
            State::NoReply => {
                if self.remaining > 0 {
                    self.state = State::Data;
                } else {
                    self.prepare_response();
                }
            }
            State::RetrievalKey | State::RetrievalKeys => self.prepare_response(),
            State::LineEnd => {
                if self.command == Command::Quit {
                    self.state = State::Quitting;
                } else {
                    self.prepare_response();
                }
            }
            State::Data
            | State::DataCr
            | State::DataLf
            | State::Swallow
            | State::Finished
            | State::Quitting => {}
        }
        Ok(())
    }

    /// Reject the command. Mid-line errors skip to the end of the line so
    /// the next command starts cleanly.
    fn fail(&mut self, error: ProtocolError, finish_now: bool) {
        debug!(error = %error, command = ?self.command, "Protocol error");
        self.metrics.counter("cmd.client_error", 1);
        self.buffer.clear();
        self.response = Response::client_error(&error.to_string());
        self.state = if finish_now {
            State::Finished
        } else {
            State::Swallow
        };
    }

    /// Run the parsed command and build its response.
    fn prepare_response(&mut self) {
        self.response = self.execute();
        self.state = State::Finished;
        trace!(
            command = ?self.command,
            keys = self.keys.len(),
            no_reply = self.no_reply,
            "Command complete"
        );
    }

    fn execute(&self) -> BytesMut {
        if self.command == Command::Ping {
            self.metrics.counter("cmd.ping", 1);
            return BytesMut::from(Response::pong());
        }
        let Some(store) = self.store.as_deref() else {
            return Response::error("The server isn't configured with a database");
        };
        let Some(key) = self.keys.first() else {
            return Response::error("No key was found in request");
        };

        match self.command {
            Command::Delete => self.execute_delete(store, key),
            Command::Add => self.execute_add(store, key),
            Command::Set => self.execute_set(store, key),
            Command::Get | Command::Gets => self.execute_get(store),
            Command::Quit | Command::Ping | Command::None => {
                Response::error("unsupported command")
            }
        }
    }

    fn execute_delete(&self, store: &dyn Store, key: &[u8]) -> BytesMut {
        match store.get(key) {
            Status::Ok(_) => {}
            Status::NotFound => {
                self.metrics.counter("cmd.delete.not_found", 1);
                return BytesMut::from(Response::not_found());
            }
            Status::Error(msg) => return self.store_error("delete", &msg),
        }

        match store.delete(key) {
            Status::Ok(()) => {
                self.metrics.counter("cmd.delete.success", 1);
                BytesMut::from(Response::deleted())
            }
            Status::NotFound => {
                self.metrics.counter("cmd.delete.not_found", 1);
                BytesMut::from(Response::not_found())
            }
            Status::Error(msg) => self.store_error("delete", &msg),
        }
    }

    fn execute_add(&self, store: &dyn Store, key: &[u8]) -> BytesMut {
        let lock = store.lock();
        let outcome = match store.get(key) {
            Status::NotFound => match store.put(key, Bytes::copy_from_slice(&self.buffer)) {
                Status::Error(msg) => Status::Error(msg),
                _ => Status::Ok(true),
            },
            // Add only applies when the key does not exist
            Status::Ok(_) => Status::Ok(false),
            Status::Error(msg) => Status::Error(msg),
        };
        lock.unlock();

        match outcome {
            Status::Ok(true) => {
                self.metrics.counter("cmd.add.stored", 1);
                BytesMut::from(Response::stored())
            }
            Status::Ok(false) | Status::NotFound => {
                self.metrics.counter("cmd.add.not_stored", 1);
                BytesMut::from(Response::not_stored())
            }
            Status::Error(msg) => self.store_error("add", &msg),
        }
    }

    fn execute_set(&self, store: &dyn Store, key: &[u8]) -> BytesMut {
        match store.put(key, Bytes::copy_from_slice(&self.buffer)) {
            Status::Error(msg) => self.store_error("set", &msg),
            _ => {
                self.metrics.counter("cmd.set.success", 1);
                BytesMut::from(Response::stored())
            }
        }
    }

    fn execute_get(&self, store: &dyn Store) -> BytesMut {
        let mut response = BytesMut::new();
        for key in &self.keys {
            match store.get(key) {
                Status::Ok(value) => {
                    self.metrics.counter("cmd.get.hit", 1);
                    Response::value(key, &value, &mut response);
                }
                Status::NotFound => self.metrics.counter("cmd.get.miss", 1),
                Status::Error(msg) => {
                    warn!(key = ?key, error = %msg, "Failed to read key");
                    self.metrics.counter("cmd.get.error", 1);
                }
            }
        }
        response.put_slice(Response::end());
        response
    }

    fn store_error(&self, op: &str, msg: &str) -> BytesMut {
        warn!(op, error = %msg, "Store operation failed");
        self.metrics.counter(&format!("cmd.{op}.error"), 1);
        Response::error(msg)
    }
}

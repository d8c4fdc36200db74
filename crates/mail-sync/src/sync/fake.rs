//! An in-memory server folder
//!
//! `FakeFolderConnection` answers searches and fetches from messages held in
//! memory, can be told to fail specific calls, and records every search
//! window so tests can check how a sync narrowed its windows.

use std::collections::{BTreeSet, VecDeque};

use super::connection::{ConnectionError, FetchedMessage, FolderConnection, RemoteFlags};
use crate::date::DateWindow;
use crate::models::{EmailAddress, RemoteBody, RemoteHeader, ServerId};

/// Calls that failures can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOp {
    Search,
    FetchFull,
    FetchFlags,
}

#[derive(Debug, Clone)]
struct ServerMessage {
    header: RemoteHeader,
    body: RemoteBody,
}

#[derive(Debug, Default)]
pub struct FakeFolderConnection {
    messages: Vec<ServerMessage>,
    next_uid: u64,
    failures: VecDeque<(FakeOp, ConnectionError)>,
    searches: Vec<DateWindow>,
    report_total: bool,
    sync_token: Option<String>,
}

impl FakeFolderConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message dated `date` with generated content
    pub fn add_message(&mut self, date: i64) -> ServerId {
        let uid = self.next_uid;
        self.next_uid += 1;
        let header = RemoteHeader {
            server_id: ServerId::new(format!("uid-{uid}")),
            conversation_id: None,
            author: EmailAddress::with_name(format!("Sender {uid}"), format!("sender{uid}@example.com")),
            date,
            flags: BTreeSet::new(),
            has_attachments: false,
            subject: format!("Message {uid}"),
            snippet: Some(format!("Body of message {uid}")),
        };
        let body = RemoteBody {
            size: 1_000,
            to: vec![EmailAddress::new("me@example.com")],
            ..RemoteBody::default()
        };
        self.add_remote(header, body)
    }

    /// Add a message exactly as given
    pub fn add_remote(&mut self, header: RemoteHeader, body: RemoteBody) -> ServerId {
        let id = header.server_id.clone();
        self.messages.push(ServerMessage { header, body });
        id
    }

    /// Add `count` messages spread evenly from `newest` back to `oldest`
    pub fn add_spread(&mut self, count: usize, newest: i64, oldest: i64) -> Vec<ServerId> {
        if count == 0 {
            return Vec::new();
        }
        let span = newest - oldest;
        let gaps = (count - 1).max(1) as i64;
        (0..count as i64)
            .map(|i| self.add_message(newest - span * i / gaps))
            .collect()
    }

    /// Delete a message on the server
    pub fn remove(&mut self, id: &ServerId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| &m.header.server_id != id);
        self.messages.len() != before
    }

    /// Replace a message's flags, as another client would
    pub fn set_flags<I, S>(&mut self, id: &ServerId, flags: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self.messages.iter_mut().find(|m| &m.header.server_id == id) {
            Some(message) => {
                message.header.flags = flags.into_iter().map(Into::into).collect();
                true
            }
            None => false,
        }
    }

    pub fn flags(&self, id: &ServerId) -> Option<&BTreeSet<String>> {
        self.messages
            .iter()
            .find(|m| &m.header.server_id == id)
            .map(|m| &m.header.flags)
    }

    /// Make the next call of `op` fail with `err`. Failures queue up.
    pub fn fail_next(&mut self, op: FakeOp, err: ConnectionError) {
        self.failures.push_back((op, err));
    }

    /// Every window searched so far, in order
    pub fn searches(&self) -> &[DateWindow] {
        &self.searches
    }

    pub fn clear_searches(&mut self) {
        self.searches.clear();
    }

    /// Report the folder's message count to the sync engine
    pub fn set_report_total(&mut self, report: bool) {
        self.report_total = report;
    }

    pub fn set_sync_token(&mut self, token: Option<String>) {
        self.sync_token = token;
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn take_failure(&mut self, op: FakeOp) -> Result<(), ConnectionError> {
        match self.failures.iter().position(|(o, _)| *o == op) {
            Some(pos) => match self.failures.remove(pos) {
                Some((_, err)) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn find(&self, id: &ServerId) -> Option<&ServerMessage> {
        self.messages.iter().find(|m| &m.header.server_id == id)
    }
}

impl FolderConnection for FakeFolderConnection {
    fn search(&mut self, window: &DateWindow) -> Result<Vec<ServerId>, ConnectionError> {
        self.take_failure(FakeOp::Search)?;
        self.searches.push(*window);
        Ok(self
            .messages
            .iter()
            .filter(|m| window.contains(m.header.date))
            .map(|m| m.header.server_id.clone())
            .collect())
    }

    fn fetch_full(&mut self, ids: &[ServerId]) -> Result<Vec<FetchedMessage>, ConnectionError> {
        self.take_failure(FakeOp::FetchFull)?;
        Ok(ids
            .iter()
            .filter_map(|id| self.find(id))
            .map(|m| FetchedMessage {
                header: m.header.clone(),
                body: m.body.clone(),
            })
            .collect())
    }

    fn fetch_flags(&mut self, ids: &[ServerId]) -> Result<Vec<RemoteFlags>, ConnectionError> {
        self.take_failure(FakeOp::FetchFlags)?;
        Ok(ids
            .iter()
            .filter_map(|id| self.find(id))
            .map(|m| RemoteFlags {
                server_id: m.header.server_id.clone(),
                flags: m.header.flags.clone(),
            })
            .collect())
    }

    fn total_messages(&self) -> Option<usize> {
        self.report_total.then_some(self.messages.len())
    }

    fn sync_token(&self) -> Option<String> {
        self.sync_token.clone()
    }
}

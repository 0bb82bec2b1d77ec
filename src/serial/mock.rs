//! Scripted transport for protocol tests.
//!
//! Each write is passed to a responder which returns the replies the device
//! will make available on successive polls: entry `i` of the returned list is
//! what the `i`-th following `read` sees (an empty entry means "nothing yet").

use super::Transport;
use crate::error::SerialError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Shared record of everything written to a [`MockTransport`].
#[derive(Clone, Default)]
pub struct MockTransportLog {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockTransportLog {
    /// Each write as a lossy UTF-8 string, in order.
    pub fn writes(&self) -> Vec<String> {
        self.writes
            .lock()
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// All writes concatenated.
    pub fn joined(&self) -> String {
        self.writes().concat()
    }

    /// Number of writes so far.
    pub fn len(&self) -> usize {
        self.writes.lock().len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, bytes: &[u8]) {
        self.writes.lock().push(bytes.to_vec());
    }
}

/// Transport whose replies are scripted per poll.
pub struct MockTransport {
    name: String,
    responder: Responder,
    polls: VecDeque<Vec<u8>>,
    pending: VecDeque<u8>,
    log: MockTransportLog,
    closed: bool,
}

impl MockTransport {
    /// Transport whose replies are computed from each write.
    pub fn with_responder<F>(name: &str, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            responder: Box::new(responder),
            polls: VecDeque::new(),
            pending: VecDeque::new(),
            log: MockTransportLog::default(),
            closed: false,
        }
    }

    /// Transport that answers the `n`-th write with `script[n]` (and nothing
    /// once the script is exhausted).
    pub fn scripted(name: &str, script: Vec<Vec<&'static str>>) -> Self {
        let mut script: VecDeque<Vec<Vec<u8>>> = script
            .into_iter()
            .map(|polls| polls.into_iter().map(|p| p.as_bytes().to_vec()).collect())
            .collect();
        Self::with_responder(name, move |_| script.pop_front().unwrap_or_default())
    }

    /// Transport that answers the `k`-th poll after every write with `reply`.
    pub fn reply_on_poll(name: &str, k: usize, reply: &'static str) -> Self {
        Self::with_responder(name, move |_| {
            let mut polls = vec![Vec::new(); k.saturating_sub(1)];
            polls.push(reply.as_bytes().to_vec());
            polls
        })
    }

    /// Make `bytes` readable immediately, as if left over from an earlier reply.
    pub fn inject(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes.iter().copied());
    }

    /// Handle to the write log.
    pub fn log(&self) -> MockTransportLog {
        self.log.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<usize, SerialError> {
        if self.closed {
            return Err(SerialError::Closed {
                port: self.name.clone(),
            });
        }
        self.log.push(bytes);
        let replies = (self.responder)(bytes);
        if !replies.is_empty() {
            self.polls = replies.into();
        }
        Ok(bytes.len())
    }

    fn read(&mut self, max_len: usize) -> Result<Vec<u8>, SerialError> {
        if self.closed {
            return Err(SerialError::Closed {
                port: self.name.clone(),
            });
        }
        if self.pending.is_empty() {
            if let Some(next) = self.polls.pop_front() {
                self.pending.extend(next);
            }
        }
        let n = max_len.min(self.pending.len());
        Ok(self.pending.drain(..n).collect())
    }

    async fn close(&mut self) -> Result<(), SerialError> {
        self.closed = true;
        Ok(())
    }
}

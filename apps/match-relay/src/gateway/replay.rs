//! Per-match broadcast log with bounded replay buffers for resume.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use pitchside_common::protocol::ChannelMessage;

/// A single broadcast stored in a match's replay buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayEntry {
    pub seq: u64,
    /// Tracker id of the publisher, or the relay itself for confirmations.
    pub from: String,
    pub message: ChannelMessage,
}

#[derive(Default)]
struct MatchLog {
    seq: u64,
    buffer: VecDeque<ReplayEntry>,
    /// Sockets currently joined to the match.
    sockets: usize,
}

/// Why a resume could not be served from the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayGap {
    /// Latest sequence number the client should continue from.
    pub latest: u64,
}

/// Shared log of every match's broadcasts.
///
/// Uses `DashMap` for shard-level concurrency and a `parking_lot::Mutex` per
/// match so sequence assignment and dispatch happen under one lock.
pub struct ReplayLog {
    capacity: usize,
    matches: DashMap<String, Mutex<MatchLog>>,
}

impl ReplayLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            matches: DashMap::new(),
        }
    }

    /// Assign the next sequence number, buffer the message, and hand the
    /// entry to `dispatch` before the match lock is released, so every
    /// subscriber sees broadcasts in sequence order.
    pub fn append(
        &self,
        match_id: &str,
        from: &str,
        message: ChannelMessage,
        dispatch: impl FnOnce(&ReplayEntry),
    ) -> u64 {
        let log = self
            .matches
            .entry(match_id.to_string())
            .or_default();
        let mut log = log.lock();
        log.seq += 1;
        let entry = ReplayEntry {
            seq: log.seq,
            from: from.to_string(),
            message,
        };
        dispatch(&entry);
        log.buffer.push_back(entry);
        while log.buffer.len() > self.capacity {
            log.buffer.pop_front();
        }
        log.seq
    }

    /// Latest sequence number in the match, 0 before the first broadcast.
    pub fn latest_seq(&self, match_id: &str) -> u64 {
        self.matches
            .get(match_id)
            .map(|log| log.lock().seq)
            .unwrap_or(0)
    }

    /// Every buffered broadcast with `seq > after_seq`.
    ///
    /// Fails when entries after `after_seq` were evicted, or when `after_seq`
    /// is ahead of the log (the relay restarted since the client last saw it).
    pub fn replay_after(&self, match_id: &str, after_seq: u64) -> Result<Vec<ReplayEntry>, ReplayGap> {
        let Some(log) = self.matches.get(match_id) else {
            return if after_seq == 0 {
                Ok(Vec::new())
            } else {
                Err(ReplayGap { latest: 0 })
            };
        };
        let log = log.lock();
        let latest = log.seq;
        if after_seq > latest {
            return Err(ReplayGap { latest });
        }

        let first = log.buffer.front().map_or(latest + 1, |entry| entry.seq);
        if after_seq + 1 < first {
            return Err(ReplayGap { latest });
        }

        Ok(log
            .buffer
            .iter()
            .filter(|entry| entry.seq > after_seq)
            .cloned()
            .collect())
    }

    /// Matches with at least one broadcast, with their latest sequence number.
    pub fn matches(&self) -> Vec<(String, u64)> {
        let mut result: Vec<(String, u64)> = self
            .matches
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().seq))
            .filter(|(_, seq)| *seq > 0)
            .collect();
        result.sort();
        result
    }

    /// Count a joined socket against the match until the returned handle is
    /// dropped. A match with attached sockets keeps its log.
    pub fn attach(self: &Arc<Self>, match_id: &str) -> LogAttachment {
        self.matches
            .entry(match_id.to_string())
            .or_default()
            .lock()
            .sockets += 1;
        LogAttachment {
            log: Arc::clone(self),
            match_id: match_id.to_string(),
        }
    }

    fn detach(&self, match_id: &str) {
        if let Some(log) = self.matches.get(match_id) {
            let mut log = log.lock();
            log.sockets = log.sockets.saturating_sub(1);
        }
    }

    /// Drop the logs of matches with no attached socket for which `keep`
    /// is false. Returns the dropped match ids.
    pub fn evict_idle(&self, keep: impl Fn(&str) -> bool) -> Vec<String> {
        let mut evicted = Vec::new();
        self.matches.retain(|match_id, log| {
            let idle = log.get_mut().sockets == 0 && !keep(match_id);
            if idle {
                evicted.push(match_id.clone());
            }
            !idle
        });
        evicted.sort();
        evicted
    }
}

/// A socket's hold on its match log; released on drop.
pub struct LogAttachment {
    log: Arc<ReplayLog>,
    match_id: String,
}

impl Drop for LogAttachment {
    fn drop(&mut self) {
        self.log.detach(&self.match_id);
    }
}

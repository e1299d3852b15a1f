//! Clipboard history and the sensitive-content check applied before text is
//! sent to a peer or written to the local clipboard.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::DeviceId;

/// Words that mark text as a credential (English and Portuguese).
const SECRET_MARKERS: &[&str] = &["password", "passwd", "senha"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipboardSource {
    Local,
    Remote(DeviceId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardEntry {
    pub content: String,
    pub source: ClipboardSource,
    pub at: DateTime<Utc>,
}

/// Newest-first history with at most `capacity` distinct entries.
#[derive(Debug, Clone)]
pub struct ClipboardHistory {
    entries: VecDeque<ClipboardEntry>,
    capacity: usize,
}

impl ClipboardHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Record `content`. An equal older entry moves to the front.
    pub fn push(&mut self, content: &str, source: ClipboardSource, at: DateTime<Utc>) {
        if self.capacity == 0 {
            return;
        }
        self.entries.retain(|e| e.content != content);
        self.entries.push_front(ClipboardEntry {
            content: content.to_string(),
            source,
            at,
        });
        self.entries.truncate(self.capacity);
    }

    pub fn entries(&self) -> Vec<ClipboardEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Text that looks like a password, a one-time code, a card number or a
/// CPF. Such text is neither synced nor written.
pub fn looks_sensitive(content: &str) -> bool {
    let lower = content.to_lowercase();
    if SECRET_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }

    let trimmed = content.trim();
    // 一次性验证码: 4-8 位纯数字
    if (4..=8).contains(&trimmed.len()) && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }

    let number_like = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '.'));
    if number_like {
        let digits = trimmed.chars().filter(char::is_ascii_digit).count();
        // card numbers, CPF
        return (13..=19).contains(&digits) || digits == 11;
    }
    false
}

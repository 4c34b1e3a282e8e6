//! Journaled logging.
//!
//! Call sites format into fixed-size records held in a global journal of
//! 256 entries guarded by a spin lock; the journal flushes synchronously
//! through `tracing` when it fills or when [`flush`] is called. A
//! thread-local context of `(kind, id)` pairs is rendered as a prefix on
//! every record so a message carries the owner, transport, handle, and
//! endpoints of the socket that produced it without each call site
//! repeating them.

use std::cell::RefCell;
use std::fmt::Write as _;

use once_cell::sync::Lazy;

/// Log severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

const MAX_RECORDS: usize = 256;
const RECORD_CAPACITY: usize = 2048;

struct Record {
    severity: Severity,
    file: &'static str,
    line: u32,
    length: usize,
    buffer: [u8; RECORD_CAPACITY],
}

impl Record {
    const fn empty() -> Self {
        Self {
            severity: Severity::Trace,
            file: "",
            line: 0,
            length: 0,
            buffer: [0; RECORD_CAPACITY],
        }
    }

    fn fill(&mut self, severity: Severity, file: &'static str, line: u32, message: &str) {
        self.severity = severity;
        self.file = file;
        self.line = line;

        let bytes = message.as_bytes();
        if bytes.len() >= RECORD_CAPACITY {
            // Truncate at a character boundary and force the final byte to
            // NUL so the record is never interpreted past its capacity.
            let mut end = RECORD_CAPACITY - 1;
            while end > 0 && !message.is_char_boundary(end) {
                end -= 1;
            }
            self.buffer[..end].copy_from_slice(&bytes[..end]);
            self.buffer[RECORD_CAPACITY - 1] = 0;
            self.length = end;
        } else {
            self.buffer[..bytes.len()].copy_from_slice(bytes);
            self.length = bytes.len();
        }
    }

    fn message(&self) -> &str {
        std::str::from_utf8(&self.buffer[..self.length]).unwrap_or("")
    }
}

struct JournalState {
    records: Vec<Record>,
    position: usize,
}

struct Journal {
    state: spin::Mutex<JournalState>,
}

static JOURNAL: Lazy<Journal> = Lazy::new(|| {
    let mut records = Vec::with_capacity(MAX_RECORDS);
    records.resize_with(MAX_RECORDS, Record::empty);
    Journal {
        state: spin::Mutex::new(JournalState {
            records,
            position: 0,
        }),
    }
});

thread_local! {
    static CONTEXT: RefCell<Vec<(&'static str, String)>> = const { RefCell::new(Vec::new()) };
}

/// Removes its context pair when dropped.
pub struct ContextGuard {
    _private: (),
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Push a `(kind, id)` pair onto the calling thread's log context.
///
/// The pair is rendered into the prefix of every record written by this
/// thread until the returned guard drops.
#[must_use]
pub fn push_context(kind: &'static str, value: impl std::fmt::Display) -> ContextGuard {
    CONTEXT.with(|stack| {
        stack.borrow_mut().push((kind, value.to_string()));
    });
    ContextGuard { _private: () }
}

fn render_prefix() -> String {
    CONTEXT.with(|stack| {
        let stack = stack.borrow();
        let mut prefix = String::new();
        for (kind, value) in stack.iter() {
            if !prefix.is_empty() {
                prefix.push(' ');
            }
            let _ = write!(prefix, "{kind} {value}");
        }
        if let Some(first) = prefix.get(0..1) {
            let upper = first.to_ascii_uppercase();
            prefix.replace_range(0..1, &upper);
        }
        prefix
    })
}

/// Write one record into the journal.
///
/// The thread's context prefix is prepended; the journal flushes itself
/// when it fills.
pub fn write(severity: Severity, file: &'static str, line: u32, message: &str) {
    let prefix = render_prefix();
    let full = if prefix.is_empty() {
        message.to_string()
    } else {
        format!("{prefix}: {message}")
    };

    let mut state = JOURNAL.state.lock();
    debug_assert!(state.position < MAX_RECORDS);

    let position = state.position;
    state.records[position].fill(severity, file, line, &full);
    state.position += 1;

    if state.position == MAX_RECORDS {
        flush_locked(&mut state);
    }
}

/// Flush every journaled record through `tracing`, in write order.
pub fn flush() {
    let mut state = JOURNAL.state.lock();
    flush_locked(&mut state);
}

fn flush_locked(state: &mut JournalState) {
    for index in 0..state.position {
        let record = &state.records[index];
        let message = record.message();
        match record.severity {
            Severity::Error => {
                tracing::error!(target: "outrigger::journal", file = record.file, line = record.line, "{message}");
            }
            Severity::Warn => {
                tracing::warn!(target: "outrigger::journal", file = record.file, line = record.line, "{message}");
            }
            Severity::Info => {
                tracing::info!(target: "outrigger::journal", file = record.file, line = record.line, "{message}");
            }
            Severity::Debug => {
                tracing::debug!(target: "outrigger::journal", file = record.file, line = record.line, "{message}");
            }
            Severity::Trace => {
                tracing::trace!(target: "outrigger::journal", file = record.file, line = record.line, "{message}");
            }
        }
    }
    state.position = 0;
}

/// Write a formatted record into the journal with the caller's location.
#[macro_export]
macro_rules! journal {
    ($severity:expr, $($arg:tt)*) => {
        $crate::log::write($severity, file!(), line!(), &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_prefix_renders_pairs() {
        let _owner = push_context("owner", "'main'");
        let _transport = push_context("transport", "'udp4'");
        let _descriptor = push_context("descriptor", 3);

        let prefix = render_prefix();
        assert_eq!(prefix, "Owner 'main' transport 'udp4' descriptor 3");
    }

    #[test]
    fn test_context_pops_on_drop() {
        {
            let _guard = push_context("monitor", 1);
            assert!(!render_prefix().is_empty());
        }
        assert!(render_prefix().is_empty());
    }

    #[test]
    fn test_record_truncation_forces_nul() {
        let mut record = Record::empty();
        let long = "x".repeat(RECORD_CAPACITY * 2);
        record.fill(Severity::Debug, file!(), line!(), &long);

        assert_eq!(record.length, RECORD_CAPACITY - 1);
        assert_eq!(record.buffer[RECORD_CAPACITY - 1], 0);
    }

    #[test]
    fn test_write_and_flush() {
        write(Severity::Info, file!(), line!(), "engine attached");
        flush();

        // Position resets after a flush; a second flush is a no-op.
        flush();
    }

    #[test]
    fn test_journal_macro() {
        journal!(Severity::Debug, "descriptor {} bound", 3);
        flush();
    }
}

//! Per-thread log capture for asserting on emitted log lines.
//!
//! A single capturing logger is installed process-wide on first use. Records
//! are collected only on threads that called [`start`], which keeps parallel
//! tests isolated as long as they run on a current-thread runtime (the
//! `#[tokio::test]` default).

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Once;

use log::{Level, LevelFilter, Log, Metadata, Record};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRecord {
    pub level: Level,
    pub message: String,
}

thread_local! {
    static RECORDS: RefCell<Option<Vec<CapturedRecord>>> = const { RefCell::new(None) };
}

struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let _ = RECORDS.try_with(|records| {
            if let Some(records) = records.borrow_mut().as_mut() {
                records.push(CapturedRecord {
                    level: record.level(),
                    message: record.args().to_string(),
                });
            }
        });
    }

    fn flush(&self) {}
}

static INSTALL: Once = Once::new();

/// Handle to the current thread's capture. Capture stops when dropped.
pub struct LogCapture {
    _not_send: PhantomData<*const ()>,
}

/// Start capturing log records on the current thread.
pub fn start() -> LogCapture {
    INSTALL.call_once(|| {
        if log::set_boxed_logger(Box::new(CaptureLogger)).is_ok() {
            log::set_max_level(LevelFilter::Trace);
        }
    });
    RECORDS.with(|records| *records.borrow_mut() = Some(Vec::new()));
    LogCapture {
        _not_send: PhantomData,
    }
}

impl LogCapture {
    pub fn records(&self) -> Vec<CapturedRecord> {
        RECORDS.with(|records| records.borrow().clone().unwrap_or_default())
    }

    pub fn messages(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.message).collect()
    }

    pub fn messages_at(&self, level: Level) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|r| r.level == level)
            .map(|r| r.message)
            .collect()
    }

    /// Whether some record has exactly this message.
    pub fn contains(&self, message: &str) -> bool {
        self.records().iter().any(|r| r.message == message)
    }

    pub fn count(&self, message: &str) -> usize {
        self.records().iter().filter(|r| r.message == message).count()
    }

    pub fn clear(&self) {
        RECORDS.with(|records| {
            if let Some(records) = records.borrow_mut().as_mut() {
                records.clear();
            }
        });
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        let _ = RECORDS.try_with(|records| *records.borrow_mut() = None);
    }
}

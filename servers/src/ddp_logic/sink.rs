//! JSON-lines output for the host process.
//!
//! Every `emit` becomes one line holding the record array; every
//! `emit_error` becomes one `{"error": ...}` line and an error log entry.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lib_ddp::{Emitter, Record, TriggerError};
use serde_json::json;

pub struct JsonLinesSink<W: Write + Send + 'static> {
    out: Mutex<W>,
    batches: AtomicU64,
    errors: AtomicU64,
}

impl JsonLinesSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send + 'static> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out), batches: AtomicU64::new(0), errors: AtomicU64::new(0) }
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn write_line(&self, line: &str) {
        let mut out = self.out.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            tracing::error!(error = %e, "Failed to write output line");
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|p| p.into_inner())
    }
}

impl<W: Write + Send + 'static> Emitter for JsonLinesSink<W> {
    fn emit(&self, records: Vec<Record>) {
        match serde_json::to_string(&records) {
            Ok(line) => {
                self.batches.fetch_add(1, Ordering::Relaxed);
                self.write_line(&line);
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize records"),
        }
    }

    fn emit_error(&self, error: TriggerError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        tracing::error!(%error, "Trigger error");
        self.write_line(&json!({ "error": error.to_string() }).to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_ddp::DisconnectedError;

    #[test]
    fn writes_one_line_per_call() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.emit(vec![Record { name: "users".into(), data: json!([{"_id": "u1"}]) }]);
        sink.emit(vec![]);
        sink.emit_error(DisconnectedError::ConnectionLost.into());
        assert_eq!((sink.batches(), sink.errors()), (2, 1));

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                r#"[{"name":"users","data":[{"_id":"u1"}]}]"#,
                "[]",
                r#"{"error":"connection lost"}"#,
            ]
        );
    }
}

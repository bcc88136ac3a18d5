// Call Detail Records
//
// One row per Call-ID, merged across milestones, written to a CSV bucket
// per day. The flushed-tombstone set is what keeps retransmitted terminal
// messages from producing a second row; it is swept by age so memory stays
// bounded.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Local;

use crate::error::ProxyError;

/// CSV column set, in file order.
pub const CSV_FIELDS: &[&str] = &[
    "record_id",
    "record_type",
    "state",
    "call_id",
    "date",
    "start_time",
    "end_time",
    "caller_uri",
    "caller_user",
    "caller_endpoint",
    "callee_uri",
    "callee_user",
    "callee_endpoint",
    "invite_time",
    "ringing_time",
    "answer_time",
    "bye_time",
    "duration_secs",
    "status_code",
    "reason",
    "user_agent",
    "contact",
    "cseq",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Call,
    Register,
    Message,
    Options,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Call => "CALL",
            RecordType::Register => "REGISTER",
            RecordType::Message => "MESSAGE",
            RecordType::Options => "OPTIONS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Started,
    Ringing,
    Answered,
    Ended,
    Failed,
    Cancelled,
    Success,
    Unregistered,
    Completed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Started => "STARTED",
            CallState::Ringing => "RINGING",
            CallState::Answered => "ANSWERED",
            CallState::Ended => "ENDED",
            CallState::Failed => "FAILED",
            CallState::Cancelled => "CANCELLED",
            CallState::Success => "SUCCESS",
            CallState::Unregistered => "UNREGISTERED",
            CallState::Completed => "COMPLETED",
        }
    }
}

/// One row in progress. String fields serialize as-is; empty means the
/// milestone was never observed.
#[derive(Debug, Clone, Default)]
pub struct CdrRecord {
    pub record_id: String,
    pub record_type: String,
    pub state: String,
    pub call_id: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub caller_uri: String,
    pub caller_user: String,
    pub caller_endpoint: String,
    pub callee_uri: String,
    pub callee_user: String,
    pub callee_endpoint: String,
    pub invite_time: String,
    pub ringing_time: String,
    pub answer_time: String,
    pub bye_time: String,
    pub duration_secs: String,
    pub status_code: String,
    pub reason: String,
    pub user_agent: String,
    pub contact: String,
    pub cseq: String,
    /// Wall-clock anchor for duration computation; never serialized.
    answered_at: Option<Instant>,
}

impl CdrRecord {
    fn csv_row(&self) -> String {
        let fields = [
            &self.record_id,
            &self.record_type,
            &self.state,
            &self.call_id,
            &self.date,
            &self.start_time,
            &self.end_time,
            &self.caller_uri,
            &self.caller_user,
            &self.caller_endpoint,
            &self.callee_uri,
            &self.callee_user,
            &self.callee_endpoint,
            &self.invite_time,
            &self.ringing_time,
            &self.answer_time,
            &self.bye_time,
            &self.duration_secs,
            &self.status_code,
            &self.reason,
            &self.user_agent,
            &self.contact,
            &self.cseq,
        ];
        fields
            .iter()
            .map(|f| escape_csv(f))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn escape_csv(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// The user part of a SIP URI string ("sip:1001@host" → "1001").
fn uri_user(uri: &str) -> String {
    let rest = match uri.find("sip:") {
        Some(pos) => &uri[pos + 4..],
        None => return String::new(),
    };
    rest.split(['@', ';', '>']).next().unwrap_or("").to_string()
}

fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

fn clock_time() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

fn clock_time_millis() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Merged CDR writer with retransmission-safe flushing.
pub struct CdrRecorder {
    base_dir: PathBuf,
    merge_mode: AtomicBool,
    record_counter: AtomicU64,
    /// Rows in progress, keyed by Call-ID (MESSAGE rows by call-id:cseq).
    cache: Mutex<HashMap<String, CdrRecord>>,
    /// Call-IDs already written, with flush time for age-based eviction.
    flushed: Mutex<HashMap<String, Instant>>,
    /// One row per Call-ID is a hard invariant: every file write serializes
    /// through this lock.
    writer: Mutex<()>,
}

impl CdrRecorder {
    pub fn new(base_dir: impl Into<PathBuf>, merge_mode: bool) -> Self {
        CdrRecorder {
            base_dir: base_dir.into(),
            merge_mode: AtomicBool::new(merge_mode),
            record_counter: AtomicU64::new(0),
            cache: Mutex::new(HashMap::new()),
            flushed: Mutex::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Hot-applied together with the rest of the config snapshot.
    pub fn set_merge_mode(&self, merge: bool) {
        self.merge_mode.store(merge, Ordering::Relaxed);
    }

    fn next_record_id(&self) -> String {
        let n = self.record_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{:06}", Local::now().format("%Y%m%d%H%M%S"), n)
    }

    /// Upsert the in-progress row for `key` and apply the milestone update.
    /// In non-merge mode every milestone becomes its own immediate row.
    pub fn record_or_update<F>(&self, key: &str, record_type: RecordType, update: F)
    where
        F: FnOnce(&mut CdrRecord),
    {
        if !self.merge_mode.load(Ordering::Relaxed) {
            let mut record = self.fresh_record(key, record_type);
            update(&mut record);
            finalize_derived_fields(&mut record);
            if let Err(e) = self.write_row(&record) {
                tracing::error!(tag = "CDR", error = %e, "milestone row write failed");
            }
            return;
        }

        let mut cache = self.cache.lock().expect("cdr cache lock poisoned");
        let record = cache
            .entry(key.to_string())
            .or_insert_with(|| self.fresh_record(key, record_type));
        update(record);
        record.end_time = clock_time();
        finalize_derived_fields(record);
    }

    fn fresh_record(&self, key: &str, record_type: RecordType) -> CdrRecord {
        let mut record = CdrRecord::default();
        record.record_id = self.next_record_id();
        record.record_type = record_type.as_str().to_string();
        record.call_id = key.to_string();
        record.date = today();
        record.start_time = clock_time();
        record.end_time = record.start_time.clone();
        record
    }

    /// Write the cached row for `key` and tombstone it. A retransmitted
    /// terminal message finds the tombstone and writes nothing.
    pub fn flush(&self, key: &str, force: bool) {
        if !self.merge_mode.load(Ordering::Relaxed) {
            return;
        }
        let record = match self
            .cache
            .lock()
            .expect("cdr cache lock poisoned")
            .remove(key)
        {
            Some(r) => r,
            None => return,
        };

        let _writer = self.writer.lock().expect("cdr writer lock poisoned");
        {
            let mut flushed = self.flushed.lock().expect("cdr flushed lock poisoned");
            if !force && flushed.contains_key(key) {
                tracing::debug!(tag = "CDR", call_id = %key, "duplicate flush suppressed");
                return;
            }
            flushed.insert(key.to_string(), Instant::now());
        }
        if let Err(e) = self.write_row(&record) {
            tracing::error!(tag = "CDR", call_id = %key, error = %e, "row write failed");
        }
    }

    /// Whether this key has already produced a row.
    pub fn is_flushed(&self, key: &str) -> bool {
        self.flushed
            .lock()
            .expect("cdr flushed lock poisoned")
            .contains_key(key)
    }

    /// Force out everything still in progress (shutdown path).
    pub fn flush_all(&self, force: bool) {
        let keys: Vec<String> = self
            .cache
            .lock()
            .expect("cdr cache lock poisoned")
            .keys()
            .cloned()
            .collect();
        for key in keys {
            self.flush(&key, force);
        }
    }

    /// Evict tombstones older than `max_age`. Returns how many were removed.
    pub fn sweep_flushed(&self, max_age: Duration, now: Instant) -> usize {
        let mut flushed = self.flushed.lock().expect("cdr flushed lock poisoned");
        let before = flushed.len();
        flushed.retain(|_, at| now.duration_since(*at) <= max_age);
        before - flushed.len()
    }

    fn write_row(&self, record: &CdrRecord) -> Result<(), ProxyError> {
        let date = today();
        let dir = self.base_dir.join(&date);
        fs::create_dir_all(&dir).map_err(|e| ProxyError::Cdr(e.to_string()))?;
        let path = dir.join(format!("cdr_{}.csv", date));

        let is_new = !path.exists();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ProxyError::Cdr(e.to_string()))?;
        if is_new {
            writeln!(file, "{}", CSV_FIELDS.join(",")).map_err(|e| ProxyError::Cdr(e.to_string()))?;
        }
        writeln!(file, "{}", record.csv_row()).map_err(|e| ProxyError::Cdr(e.to_string()))?;
        Ok(())
    }

    // --- Milestone entry points ---

    pub fn record_register(
        &self,
        call_id: &str,
        aor: &str,
        source: SocketAddr,
        contact: &str,
        expires: u32,
        user_agent: &str,
        cseq: &str,
    ) {
        self.record_or_update(call_id, RecordType::Register, |r| {
            r.state = CallState::Success.as_str().to_string();
            r.caller_uri = aor.to_string();
            r.caller_endpoint = source.to_string();
            r.contact = contact.to_string();
            r.status_code = "200".to_string();
            r.reason = format!("expires={}", expires);
            r.user_agent = user_agent.to_string();
            r.cseq = cseq.to_string();
        });
        self.flush(call_id, false);
    }

    pub fn record_unregister(
        &self,
        call_id: &str,
        aor: &str,
        source: SocketAddr,
        contact: &str,
        user_agent: &str,
        cseq: &str,
    ) {
        self.record_or_update(call_id, RecordType::Register, |r| {
            r.state = CallState::Unregistered.as_str().to_string();
            r.caller_uri = aor.to_string();
            r.caller_endpoint = source.to_string();
            r.contact = contact.to_string();
            r.status_code = "200".to_string();
            r.user_agent = user_agent.to_string();
            r.cseq = cseq.to_string();
        });
        self.flush(call_id, false);
    }

    /// `callee` is None when the INVITE never resolved to a target
    /// (480 path).
    #[allow(clippy::too_many_arguments)]
    pub fn record_call_start(
        &self,
        call_id: &str,
        caller_uri: &str,
        callee_uri: &str,
        caller: SocketAddr,
        callee: Option<SocketAddr>,
        user_agent: &str,
        cseq: &str,
    ) {
        self.record_or_update(call_id, RecordType::Call, |r| {
            r.state = CallState::Started.as_str().to_string();
            r.caller_uri = caller_uri.to_string();
            r.callee_uri = callee_uri.to_string();
            r.caller_endpoint = caller.to_string();
            if let Some(callee) = callee {
                r.callee_endpoint = callee.to_string();
            }
            r.invite_time = clock_time_millis();
            r.user_agent = user_agent.to_string();
            r.cseq = cseq.to_string();
        });
    }

    pub fn record_call_ringing(&self, call_id: &str) {
        self.record_or_update(call_id, RecordType::Call, |r| {
            if r.ringing_time.is_empty() {
                r.ringing_time = clock_time_millis();
            }
            if r.state == CallState::Started.as_str() {
                r.state = CallState::Ringing.as_str().to_string();
            }
        });
    }

    pub fn record_call_answer(&self, call_id: &str, callee: SocketAddr) {
        self.record_or_update(call_id, RecordType::Call, |r| {
            r.state = CallState::Answered.as_str().to_string();
            r.callee_endpoint = callee.to_string();
            if r.answer_time.is_empty() {
                r.answer_time = clock_time_millis();
                r.answered_at = Some(Instant::now());
            }
            r.status_code = "200".to_string();
            r.reason = "OK".to_string();
        });
    }

    pub fn record_call_end(&self, call_id: &str, reason: &str) {
        self.record_or_update(call_id, RecordType::Call, |r| {
            r.state = CallState::Ended.as_str().to_string();
            r.bye_time = clock_time_millis();
            r.reason = reason.to_string();
            if let Some(answered) = r.answered_at {
                r.duration_secs = format!("{:.2}", answered.elapsed().as_secs_f64());
            }
        });
        self.flush(call_id, false);
    }

    pub fn record_call_fail(&self, call_id: &str, status: u16, reason: &str) {
        self.record_or_update(call_id, RecordType::Call, |r| {
            r.state = CallState::Failed.as_str().to_string();
            r.status_code = status.to_string();
            r.reason = reason.to_string();
        });
        self.flush(call_id, false);
    }

    /// Dialog retired by the idle sweep without a terminal message.
    pub fn record_call_timeout(&self, call_id: &str) {
        self.record_or_update(call_id, RecordType::Call, |r| {
            r.state = CallState::Failed.as_str().to_string();
            r.reason = "Timeout".to_string();
        });
        self.flush(call_id, false);
    }

    pub fn record_call_cancel(&self, call_id: &str) {
        self.record_or_update(call_id, RecordType::Call, |r| {
            r.state = CallState::Cancelled.as_str().to_string();
            r.reason = "User Cancelled".to_string();
        });
        self.flush(call_id, false);
    }

    /// MESSAGE rows are keyed call-id:cseq so a session reusing one Call-ID
    /// still yields one row per message.
    #[allow(clippy::too_many_arguments)]
    pub fn record_message(
        &self,
        call_id: &str,
        cseq: &str,
        caller_uri: &str,
        callee_uri: &str,
        caller: SocketAddr,
        user_agent: &str,
    ) {
        let key = format!("{}:{}", call_id, cseq);
        self.record_or_update(&key, RecordType::Message, |r| {
            r.state = CallState::Completed.as_str().to_string();
            r.call_id = call_id.to_string();
            r.caller_uri = caller_uri.to_string();
            r.callee_uri = callee_uri.to_string();
            r.caller_endpoint = caller.to_string();
            r.user_agent = user_agent.to_string();
            r.cseq = cseq.to_string();
        });
        self.flush(&key, false);
    }

    pub fn record_options(
        &self,
        call_id: &str,
        caller_uri: &str,
        callee_uri: &str,
        caller: SocketAddr,
        cseq: &str,
    ) {
        self.record_or_update(call_id, RecordType::Options, |r| {
            r.state = CallState::Completed.as_str().to_string();
            r.caller_uri = caller_uri.to_string();
            r.callee_uri = callee_uri.to_string();
            r.caller_endpoint = caller.to_string();
            r.status_code = "200".to_string();
            r.reason = "OK".to_string();
            r.cseq = cseq.to_string();
        });
        self.flush(call_id, false);
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

fn finalize_derived_fields(record: &mut CdrRecord) {
    if record.caller_user.is_empty() && !record.caller_uri.is_empty() {
        record.caller_user = uri_user(&record.caller_uri);
    }
    if record.callee_user.is_empty() && !record.callee_uri.is_empty() {
        record.callee_user = uri_user(&record.callee_uri);
    }
}

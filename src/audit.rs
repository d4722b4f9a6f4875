//! Append-only, filterable, exportable event log for everything
//! `AccessManager`'s session-scoped log does not cover: key rotations,
//! login/logout, configuration changes. Spec.md §4.4 permits folding this
//! into `AccessManager`'s log with an event-type column; this crate keeps it
//! a separate ring so `SecuritySystem` has one place to record every kind of
//! event without taking on `AccessManager`'s session bookkeeping.

use std::sync::RwLock;

use chrono::Utc;
use serde_json::json;

use crate::types::AuditEvent;

pub struct AuditLogger {
    max_entries: usize,
    events: RwLock<Vec<AuditEvent>>,
}

impl AuditLogger {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            events: RwLock::new(Vec::new()),
        }
    }

    /// Never fails. If the lock were ever poisoned this degrades to
    /// silently dropping the event rather than panicking the caller — audit
    /// writes must not be fatal to the operation they describe (spec.md
    /// §4.8).
    pub fn log(&self, event: AuditEvent) {
        let Ok(mut events) = self.events.write() else {
            return;
        };
        if events.len() >= self.max_entries {
            events.remove(0);
        }
        events.push(event);
    }

    pub fn record(
        &self,
        doctor_id: u64,
        patient_id: u64,
        action: &str,
        record_type: Option<&str>,
        record_id: Option<u64>,
        success: bool,
        details: Option<serde_json::Value>,
    ) {
        self.log(AuditEvent {
            timestamp: Utc::now(),
            doctor_id,
            patient_id,
            action: action.to_string(),
            record_type: record_type.map(str::to_string),
            record_id,
            success,
            details: details.unwrap_or_else(|| json!({})),
        });
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<AuditEvent> {
        self.events.read().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn export_json(&self) -> String {
        serde_json::to_string_pretty(&self.all()).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn export_csv(&self) -> String {
        let mut out = String::from("timestamp,doctor_id,patient_id,action,record_type,record_id,success\n");
        for event in self.all() {
            out.push_str(&format!(
                "{},{},{},{},{},{},{}\n",
                event.timestamp.to_rfc3339(),
                event.doctor_id,
                event.patient_id,
                csv_escape(&event.action),
                event.record_type.as_deref().unwrap_or(""),
                event
                    .record_id
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
                event.success,
            ));
        }
        out
    }

    pub fn export_html(&self) -> String {
        let mut rows = String::new();
        for event in self.all() {
            rows.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                html_escape(&event.timestamp.to_rfc3339()),
                event.doctor_id,
                event.patient_id,
                html_escape(&event.action),
                event.success,
            ));
        }
        format!(
            "<table><thead><tr><th>Timestamp</th><th>Doctor</th><th>Patient</th><th>Action</th><th>Success</th></tr></thead><tbody>\n{rows}</tbody></table>"
        )
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

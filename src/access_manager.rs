//! Session issuance, validation, revocation, and the access-event log.
//! `{sessions, logs}` live behind one `RwLock`, matching spec.md §5.

use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde_json::json;

use crate::types::{AccessSession, AccessType, AuditEvent, Permissions};

/// Optional filters for [`AccessManager::get_logs`]. `None` on any field
/// means "do not filter on this dimension".
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub doctor_id: Option<u64>,
    pub patient_id: Option<u64>,
    pub action: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl LogFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(doctor_id) = self.doctor_id {
            if event.doctor_id != doctor_id {
                return false;
            }
        }
        if let Some(patient_id) = self.patient_id {
            if event.patient_id != patient_id {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if &event.action != action {
                return false;
            }
        }
        if let Some(from) = self.date_from {
            if event.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if event.timestamp > to {
                return false;
            }
        }
        true
    }
}

struct AccessManagerState {
    sessions: std::collections::HashMap<String, AccessSession>,
    logs: Vec<AuditEvent>,
}

pub struct AccessManager {
    max_log_entries: usize,
    state: RwLock<AccessManagerState>,
}

impl AccessManager {
    pub fn new(max_log_entries: usize) -> Self {
        Self {
            max_log_entries: max_log_entries.max(1),
            state: RwLock::new(AccessManagerState {
                sessions: std::collections::HashMap::new(),
                logs: Vec::new(),
            }),
        }
    }

    /// Issues a capability for `duration_hours`. `permissions` overrides the
    /// defaults-by-type table in spec.md §4.3 when supplied. Logs exactly one
    /// `create_session` audit event, mirroring `revoke`.
    pub fn create_session(
        &self,
        doctor_id: u64,
        patient_id: u64,
        access_type: AccessType,
        permissions: Option<Permissions>,
        duration_hours: f64,
    ) -> AccessSession {
        let now = Utc::now();
        let session_id = format!("session_{doctor_id}_{patient_id}_{}", hex_token(4));
        let session = AccessSession {
            session_id,
            doctor_id,
            patient_id,
            access_type,
            permissions: permissions.unwrap_or_else(|| Permissions::defaults_for(access_type)),
            created_at: now,
            expires_at: now + duration_from_hours(duration_hours),
            last_used: None,
            active: true,
        };

        {
            let mut state = self.state.write().expect("access manager lock poisoned");
            state.sessions.insert(session.session_id.clone(), session.clone());
        }

        self.log_access(
            doctor_id,
            patient_id,
            "create_session",
            None,
            true,
            Some(json!({ "session_id": session.session_id })),
        );

        session
    }

    /// True iff `active ∧ now < expires_at`. Expiry detected here flips
    /// `active = false` as a side effect (I4).
    pub fn validate(&self, session_id: &str) -> bool {
        let now = Utc::now();
        let mut state = self.state.write().expect("access manager lock poisoned");
        match state.sessions.get_mut(session_id) {
            Some(session) if session.active && now < session.expires_at => true,
            Some(session) => {
                session.active = false;
                false
            }
            None => false,
        }
    }

    /// Returns the session if present, bumping `last_used` when active.
    pub fn get(&self, session_id: &str) -> Option<AccessSession> {
        let mut state = self.state.write().expect("access manager lock poisoned");
        let session = state.sessions.get_mut(session_id)?;
        if session.active {
            session.last_used = Some(Utc::now());
        }
        Some(session.clone())
    }

    /// Deactivates the session and logs the event. A second call on the same
    /// id returns `false` (R3).
    pub fn revoke(&self, session_id: &str) -> bool {
        let revoked = {
            let mut state = self.state.write().expect("access manager lock poisoned");
            match state.sessions.get_mut(session_id) {
                Some(session) if session.active => {
                    session.active = false;
                    Some((session.doctor_id, session.patient_id))
                }
                _ => None,
            }
        };

        match revoked {
            Some((doctor_id, patient_id)) => {
                self.log_access(
                    doctor_id,
                    patient_id,
                    "revoke_session",
                    None,
                    true,
                    Some(json!({ "session_id": session_id })),
                );
                true
            }
            None => false,
        }
    }

    /// Revokes every active session of `doctor_id`, optionally scoped to
    /// `patient_id`, returning the count revoked.
    pub fn revoke_all(&self, doctor_id: u64, patient_id: Option<u64>) -> usize {
        let mut state = self.state.write().expect("access manager lock poisoned");
        let mut count = 0;
        for session in state.sessions.values_mut() {
            if session.doctor_id != doctor_id || !session.active {
                continue;
            }
            if let Some(patient_id) = patient_id {
                if session.patient_id != patient_id {
                    continue;
                }
            }
            session.active = false;
            count += 1;
        }
        count
    }

    pub fn active_sessions(&self) -> Vec<AccessSession> {
        self.state
            .read()
            .expect("access manager lock poisoned")
            .sessions
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect()
    }

    /// Lazily expires every session whose `expires_at` has passed, returning
    /// the count expired. A convenience for a host-driven sweep; correctness
    /// does not depend on it being called (validation expires lazily too).
    pub fn cleanup_expired_sessions(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.write().expect("access manager lock poisoned");
        let mut count = 0;
        for session in state.sessions.values_mut() {
            if session.active && now >= session.expires_at {
                session.active = false;
                count += 1;
            }
        }
        count
    }

    /// Appends an audit event, dropping the oldest entry once
    /// `max_log_entries` is reached (B4).
    pub fn log_access(
        &self,
        doctor_id: u64,
        patient_id: u64,
        action: &str,
        record_type: Option<&str>,
        success: bool,
        details: Option<serde_json::Value>,
    ) {
        let event = AuditEvent {
            timestamp: Utc::now(),
            doctor_id,
            patient_id,
            action: action.to_string(),
            record_type: record_type.map(str::to_string),
            record_id: None,
            success,
            details: details.unwrap_or_else(|| json!({})),
        };

        let mut state = self.state.write().expect("access manager lock poisoned");
        if state.logs.len() >= self.max_log_entries {
            state.logs.remove(0);
        }
        state.logs.push(event);
    }

    pub fn get_logs(&self, filter: &LogFilter, limit: usize, offset: usize) -> Vec<AuditEvent> {
        let state = self.state.read().expect("access manager lock poisoned");
        state
            .logs
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn log_count(&self) -> usize {
        self.state.read().expect("access manager lock poisoned").logs.len()
    }
}

fn duration_from_hours(hours: f64) -> Duration {
    Duration::milliseconds((hours * 3_600_000.0).round() as i64)
}

fn hex_token(bytes: usize) -> String {
    use std::fmt::Write;
    let mut raw = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    let mut s = String::with_capacity(bytes * 2);
    for b in raw {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

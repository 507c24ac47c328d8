//! Attendance session: remembers the latest recognition and decides whether
//! an attendance request may be credited.
//!
//! The session performs no I/O. The caller fetches today's records, calls
//! [`AttendanceSession::commit`], and persists the returned record itself.

use crate::gate::DetectionState;
use crate::report;
use crate::types::{AttendanceRecord, Identity, RecognitionResult};
use chrono::{DateTime, Local};
use thiserror::Error;

/// A recognition older than this cannot be credited.
pub const DETECTION_WINDOW_MS: i64 = 2000;

/// Placeholder external ID for identities enrolled without one.
pub const MISSING_EXTERNAL_ID: &str = "N/A";

/// Why an attendance request was not credited. These are expected,
/// user-facing outcomes, not faults.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommitRejection {
    #[error("camera is not running")]
    SessionStopped,
    #[error("no recognized person in view")]
    NoRecentMatch,
    #[error("detection expired ({age_ms} ms old); face the camera again")]
    DetectionExpired { age_ms: i64 },
    #[error("{name} already marked attendance today at {at}")]
    AlreadyMarked { name: String, at: String },
}

/// The most recent accepted recognition.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub identity: Identity,
    pub similarity: f32,
    pub observed_at: DateTime<Local>,
}

#[derive(Debug, Default)]
pub struct AttendanceSession {
    active: bool,
    last_observation: Option<Observation>,
    last_timestamp: i64,
}

impl AttendanceSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.active = true;
        self.last_observation = None;
        tracing::info!("attendance session started");
    }

    /// Stop accepting observations and drop any held recognition.
    pub fn stop(&mut self) {
        self.active = false;
        self.last_observation = None;
        tracing::info!("attendance session stopped");
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn last_observation(&self) -> Option<&Observation> {
        self.last_observation.as_ref()
    }

    pub fn observe(&mut self, state: DetectionState, recognition: RecognitionResult) {
        self.observe_at(state, recognition, Local::now());
    }

    /// Record this frame's outcome. Anything other than a single-face match
    /// clears the held observation.
    pub fn observe_at(&mut self, state: DetectionState, recognition: RecognitionResult, now: DateTime<Local>) {
        if !self.active {
            self.last_observation = None;
            return;
        }
        self.last_observation = match (state, recognition) {
            (DetectionState::Single, RecognitionResult::Matched { identity, similarity }) => {
                Some(Observation {
                    identity,
                    similarity,
                    observed_at: now,
                })
            }
            _ => None,
        };
    }

    pub fn commit(
        &mut self,
        today: &str,
        existing: &[AttendanceRecord],
    ) -> Result<AttendanceRecord, CommitRejection> {
        self.commit_at(today, existing, Local::now())
    }

    /// Decide whether the held observation earns a new attendance record for
    /// `today`, given the records already stored.
    pub fn commit_at(
        &mut self,
        today: &str,
        existing: &[AttendanceRecord],
        now: DateTime<Local>,
    ) -> Result<AttendanceRecord, CommitRejection> {
        if !self.active {
            return Err(CommitRejection::SessionStopped);
        }
        let observation = self
            .last_observation
            .as_ref()
            .ok_or(CommitRejection::NoRecentMatch)?;

        let age_ms = (now - observation.observed_at).num_milliseconds();
        if age_ms > DETECTION_WINDOW_MS {
            return Err(CommitRejection::DetectionExpired { age_ms });
        }

        let name = &observation.identity.display_name;
        let folded = name.to_lowercase();
        if let Some(prior) = existing
            .iter()
            .find(|r| r.date == today && r.display_name.to_lowercase() == folded)
        {
            return Err(CommitRejection::AlreadyMarked {
                name: name.clone(),
                at: prior.time.clone(),
            });
        }

        let timestamp = now.timestamp_millis().max(self.last_timestamp + 1);
        self.last_timestamp = timestamp;

        let record = AttendanceRecord {
            display_name: name.clone(),
            external_id: observation
                .identity
                .external_id
                .clone()
                .unwrap_or_else(|| MISSING_EXTERNAL_ID.to_string()),
            date: today.to_string(),
            time: report::clock_time(&now),
            timestamp,
        };
        tracing::info!(
            name = %record.display_name,
            external_id = %record.external_id,
            date = %record.date,
            similarity = observation.similarity,
            "attendance committed"
        );
        Ok(record)
    }
}

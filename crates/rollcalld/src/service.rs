//! Attendance state shared between the engine thread and D-Bus handlers.
//!
//! The gallery, session and latest detection live behind short-lived std
//! mutexes so the engine thread can update them every tick. Read-modify-write
//! operations against the store (enrollment, attendance commits) are
//! serialized by async locks held across the store round trip.

use crate::config::snapshot_path_for;
use chrono::Local;
use rollcall_core::report::{self, DailyStats};
use rollcall_core::session::MISSING_EXTERNAL_ID;
use rollcall_core::{
    AttendanceRecord, AttendanceSession, CommitRejection, DetectionState, Embedding, FaceBox,
    FrameOutcome, FrameSample, GalleryError, GalleryStore, Identity, IdentityRecord, LoadSummary,
    Matcher, Recognizer,
};
use rollcall_store::{NewIdentity, Store, StoreError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0} is already enrolled")]
    DuplicateIdentity(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<GalleryError> for ServiceError {
    fn from(err: GalleryError) -> Self {
        match err {
            GalleryError::DuplicateIdentity(name) => ServiceError::DuplicateIdentity(name),
        }
    }
}

/// An enrolled person as reported to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySummary {
    pub record_id: i64,
    pub display_name: String,
    pub external_id: String,
    pub enrolled_at: String,
    pub has_face_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

impl From<IdentityRecord> for IdentitySummary {
    fn from(record: IdentityRecord) -> Self {
        Self {
            record_id: record.record_id,
            display_name: record.display_name,
            external_id: record
                .external_id
                .unwrap_or_else(|| MISSING_EXTERNAL_ID.to_string()),
            enrolled_at: record.enrolled_at,
            has_face_data: record.embedding.is_some(),
            image_path: record.image_path,
        }
    }
}

/// Latest recognition held by the session, for status reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMatch {
    pub display_name: String,
    pub similarity: f32,
    pub age_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub session_active: bool,
    pub detection: DetectionState,
    pub face_count: usize,
    pub last_match: Option<LastMatch>,
    pub enrolled: usize,
    pub store_available: bool,
    pub unsynced_records: usize,
}

pub struct Attendance {
    store: Option<Store>,
    gallery: Mutex<GalleryStore>,
    session: Mutex<AttendanceSession>,
    detection: Mutex<(DetectionState, usize)>,
    /// Records committed while the store refused the append.
    local_ledger: Mutex<Vec<AttendanceRecord>>,
    /// Last listing the store returned, plus appends since.
    stored_cache: Mutex<Vec<AttendanceRecord>>,
    enroll_lock: tokio::sync::Mutex<()>,
    commit_lock: tokio::sync::Mutex<()>,
}

impl Attendance {
    /// `store` is `None` when the database could not be opened; the service
    /// then keeps everything in memory.
    pub fn new(store: Option<Store>) -> Self {
        Self {
            store,
            gallery: Mutex::new(GalleryStore::new()),
            session: Mutex::new(AttendanceSession::new()),
            detection: Mutex::new((DetectionState::Empty, 0)),
            local_ledger: Mutex::new(Vec::new()),
            stored_cache: Mutex::new(Vec::new()),
            enroll_lock: tokio::sync::Mutex::new(()),
            commit_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Rebuild the gallery from the store. On failure the current gallery is
    /// kept as is.
    pub async fn load_gallery(&self) -> Option<LoadSummary> {
        let store = self.store.as_ref()?;
        match store.list_identities().await {
            Ok(records) => Some(lock(&self.gallery).load(records)),
            Err(e) => {
                tracing::warn!(error = %e, "could not read identities; keeping current gallery");
                None
            }
        }
    }

    pub fn start_session(&self) {
        lock(&self.session).start();
    }

    pub fn stop_session(&self) {
        lock(&self.session).stop();
        *lock(&self.detection) = (DetectionState::Empty, 0);
    }

    /// Run one detection tick against the current gallery and record the
    /// outcome in the session.
    pub fn observe_frame<M, F>(
        &self,
        recognizer: &mut Recognizer<M>,
        frame: &F,
        faces: &[FaceBox],
    ) -> FrameOutcome
    where
        M: Matcher,
        F: FrameSample + ?Sized,
    {
        let outcome = {
            let gallery = lock(&self.gallery);
            recognizer.recognize(frame, faces, gallery.all())
        };
        if let Some(name) = outcome.recognition.display_name() {
            tracing::debug!(name, "recognized");
        }
        lock(&self.session).observe(outcome.state, outcome.recognition.clone());
        *lock(&self.detection) = (outcome.state, outcome.face_count);
        outcome
    }

    /// Fail early if `display_name` or `external_id` is already taken.
    pub async fn check_enrollable(
        &self,
        display_name: &str,
        external_id: &str,
    ) -> Result<(), ServiceError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(ServiceError::InvalidInput("name must not be empty".into()));
        }
        let external_id = normalize_external_id(external_id);
        {
            let gallery = lock(&self.gallery);
            if gallery.contains(display_name) {
                return Err(ServiceError::DuplicateIdentity(display_name.to_string()));
            }
            if let Some(id) = external_id.as_deref() {
                if let Some(owner) = gallery
                    .all()
                    .iter()
                    .find(|i| i.external_id.as_deref() == Some(id))
                {
                    return Err(ServiceError::DuplicateIdentity(format!(
                        "external ID {id} (held by {})",
                        owner.display_name
                    )));
                }
            }
        }
        if let (Some(store), Some(id)) = (&self.store, external_id.as_deref()) {
            if let Some(owner) = store.find_identity(id).await? {
                return Err(ServiceError::DuplicateIdentity(format!(
                    "external ID {id} (held by {})",
                    owner.display_name
                )));
            }
        }
        Ok(())
    }

    /// Persist and index a new identity.
    ///
    /// The external ID is trimmed and upper-cased; an empty one is stored as
    /// absent. A `pending_snapshot` is moved next to itself under the new
    /// record ID; on error it is left where it is for the caller to discard.
    pub async fn enroll(
        &self,
        display_name: &str,
        external_id: &str,
        embedding: Embedding,
        pending_snapshot: Option<PathBuf>,
    ) -> Result<Identity, ServiceError> {
        let _guard = self.enroll_lock.lock().await;
        self.check_enrollable(display_name, external_id).await?;

        let display_name = display_name.trim().to_string();
        let external_id = normalize_external_id(external_id);
        let enrolled_at = report::enrollment_date(&Local::now());

        let record_id = match &self.store {
            Some(store) => {
                let created = store
                    .create_identity(NewIdentity {
                        display_name: display_name.clone(),
                        external_id: external_id.clone(),
                        embedding: embedding.values().to_vec(),
                        enrolled_at: enrolled_at.clone(),
                        image_path: None,
                    })
                    .await;
                match created {
                    Ok(id) => id,
                    Err(StoreError::DuplicateKey) => {
                        return Err(ServiceError::DuplicateIdentity(display_name));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            None => {
                tracing::warn!(name = %display_name, "store unavailable; enrollment kept in memory only");
                Local::now().timestamp_millis()
            }
        };

        if let Some(pending) = pending_snapshot {
            self.file_snapshot(record_id, &pending).await;
        }

        let identity = Identity {
            display_name,
            external_id,
            embedding,
            enrolled_at,
            record_id,
        };
        lock(&self.gallery).enroll(identity.clone())?;
        tracing::info!(
            name = %identity.display_name,
            record_id,
            enrolled = lock(&self.gallery).len(),
            "identity enrolled"
        );
        Ok(identity)
    }

    /// Move a pending snapshot to its record's name and remember it.
    async fn file_snapshot(&self, record_id: i64, pending: &Path) {
        let target = snapshot_path_for(pending, record_id);
        if let Err(e) = tokio::fs::rename(pending, &target).await {
            tracing::warn!(path = %pending.display(), error = %e, "snapshot not kept");
            let _ = tokio::fs::remove_file(pending).await;
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        let path = target.to_string_lossy().into_owned();
        if let Err(e) = store.set_image_path(record_id, Some(path)).await {
            tracing::warn!(record_id, error = %e, "snapshot path not recorded");
        }
    }

    /// Delete an identity and its snapshot. Returns false if nothing had
    /// `record_id`.
    pub async fn remove(&self, record_id: i64) -> Result<bool, ServiceError> {
        let _guard = self.enroll_lock.lock().await;

        let stored = match &self.store {
            Some(store) => store.delete_identity(record_id).await?,
            None => None,
        };
        let indexed = lock(&self.gallery).remove(record_id);

        if let Some(path) = stored.as_ref().and_then(|r| r.image_path.as_deref()) {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::debug!(path, error = %e, "snapshot not removed");
            }
        }

        let removed = stored.is_some() || indexed.is_some();
        if removed {
            tracing::info!(record_id, "identity removed");
        }
        Ok(removed)
    }

    pub async fn list_identities(&self) -> Vec<IdentitySummary> {
        if let Some(store) = &self.store {
            match store.list_identities().await {
                Ok(records) => return records.into_iter().map(IdentitySummary::from).collect(),
                Err(e) => tracing::warn!(error = %e, "could not read identities; listing gallery"),
            }
        }
        lock(&self.gallery)
            .all()
            .iter()
            .map(|i| IdentitySummary::from(IdentityRecord::from_identity(i, None)))
            .collect()
    }

    /// Credit the person currently held by the session, if the session
    /// allows it.
    ///
    /// Rejections are ordinary outcomes and come back as the inner `Err`.
    pub async fn mark_attendance(&self) -> Result<AttendanceRecord, CommitRejection> {
        let _guard = self.commit_lock.lock().await;

        let existing = self.attendance_records().await;
        let today = report::attendance_day(&Local::now());
        let record = lock(&self.session).commit(&today, &existing)?;

        let persisted = match &self.store {
            Some(store) => match store.append_attendance(record.clone()).await {
                Ok(()) => {
                    lock(&self.stored_cache).push(record.clone());
                    true
                }
                Err(e) => {
                    tracing::warn!(error = %e, "attendance append failed; keeping record locally");
                    false
                }
            },
            None => false,
        };
        if !persisted {
            lock(&self.local_ledger).push(record.clone());
        }

        tracing::info!(
            name = %record.display_name,
            external_id = %record.external_id,
            time = %record.time,
            persisted,
            "attendance stored"
        );
        Ok(record)
    }

    /// Every known record: the store's, followed by any held locally.
    ///
    /// When the store cannot be read, its last successful listing stands in
    /// so the same-day check still sees earlier records.
    pub async fn attendance_records(&self) -> Vec<AttendanceRecord> {
        let mut records = match &self.store {
            Some(store) => match store.list_attendance().await {
                Ok(records) => {
                    *lock(&self.stored_cache) = records.clone();
                    records
                }
                Err(e) => {
                    let cached = lock(&self.stored_cache).clone();
                    tracing::warn!(
                        error = %e,
                        cached = cached.len(),
                        "could not read attendance; using last known records"
                    );
                    cached
                }
            },
            None => Vec::new(),
        };
        records.extend(lock(&self.local_ledger).iter().cloned());
        records
    }

    /// Records for `day`, newest first. An empty `day` means today.
    pub async fn attendance_for(&self, day: &str) -> Vec<AttendanceRecord> {
        let day = if day.trim().is_empty() {
            report::attendance_day(&Local::now())
        } else {
            day.trim().to_string()
        };
        report::records_for_day(&self.attendance_records().await, &day)
    }

    pub async fn export_csv(&self) -> String {
        report::to_csv(&self.attendance_records().await)
    }

    /// Drop every attendance record, stored and local.
    pub async fn clear_attendance(&self) -> Result<usize, ServiceError> {
        let _guard = self.commit_lock.lock().await;
        let stored = match &self.store {
            Some(store) => store.clear_attendance().await?,
            None => 0,
        };
        lock(&self.stored_cache).clear();
        let local = std::mem::take(&mut *lock(&self.local_ledger)).len();
        Ok(stored + local)
    }

    pub async fn stats(&self) -> DailyStats {
        let records = self.attendance_records().await;
        let today = report::attendance_day(&Local::now());
        let enrolled = lock(&self.gallery).len();
        DailyStats::compute(enrolled, &records, &today)
    }

    pub fn snapshot(&self) -> Snapshot {
        let (detection, face_count) = *lock(&self.detection);
        let (session_active, last_match) = {
            let session = lock(&self.session);
            let last = session.last_observation().map(|o| LastMatch {
                display_name: o.identity.display_name.clone(),
                similarity: o.similarity,
                age_ms: (Local::now() - o.observed_at).num_milliseconds(),
            });
            (session.is_active(), last)
        };
        Snapshot {
            session_active,
            detection,
            face_count,
            last_match,
            enrolled: lock(&self.gallery).len(),
            store_available: self.store.is_some(),
            unsynced_records: lock(&self.local_ledger).len(),
        }
    }
}

fn normalize_external_id(external_id: &str) -> Option<String> {
    Some(external_id.trim().to_uppercase()).filter(|id| !id.is_empty())
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

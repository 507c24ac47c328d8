use crate::config::Config;
use crate::engine::{EngineControl, EngineError};
use crate::service::{Attendance, ServiceError};
use rollcall_core::CommitRejection;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    service: Arc<Attendance>,
    engine: Arc<EngineControl>,
    config: Config,
}

impl AttendanceService {
    pub fn new(service: Arc<Attendance>, engine: Arc<EngineControl>, config: Config) -> Self {
        Self {
            service,
            engine,
            config,
        }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Open the camera and begin a session. Returns false if already running.
    async fn start(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("start requested");
        self.engine.start().await.map_err(engine_error)
    }

    /// Stop the camera and end the session. Returns false if not running.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop requested");
        Ok(self.engine.stop().await)
    }

    /// Enroll the single person in front of the camera.
    async fn enroll(&self, name: &str, external_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, external_id, "enroll requested");
        self.service
            .check_enrollable(name, external_id)
            .await
            .map_err(service_error)?;

        let capture = self
            .engine
            .capture(Some(self.config.pending_snapshot_path()))
            .await
            .map_err(engine_error)?;

        let pending = capture.image_path.clone();
        let enrolled = self
            .service
            .enroll(name, external_id, capture.embedding, capture.image_path)
            .await;

        match enrolled {
            Ok(identity) => Ok(serde_json::json!({
                "recordId": identity.record_id,
                "displayName": identity.display_name,
                "externalId": identity.external_id,
                "enrolledAt": identity.enrolled_at,
                "confidence": capture.confidence,
            })
            .to_string()),
            Err(e) => {
                if let Some(path) = pending {
                    let _ = tokio::fs::remove_file(path).await;
                }
                Err(service_error(e))
            }
        }
    }

    /// Remove an enrolled identity by record ID.
    async fn remove(&self, record_id: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(record_id, "remove requested");
        self.service.remove(record_id).await.map_err(service_error)
    }

    /// List enrolled identities as JSON.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.service.list_identities().await;
        to_json(&identities)
    }

    /// Credit the person currently recognized.
    ///
    /// Refusals are reported in the result, not as D-Bus errors.
    async fn mark_attendance(&self) -> zbus::fdo::Result<String> {
        let reply = match self.service.mark_attendance().await {
            Ok(record) => serde_json::json!({ "marked": true, "record": record }),
            Err(rejection) => {
                tracing::info!(reason = %rejection, "attendance not marked");
                serde_json::json!({
                    "marked": false,
                    "reason": rejection_kind(&rejection),
                    "message": rejection.to_string(),
                })
            }
        };
        Ok(reply.to_string())
    }

    /// Attendance for a day ("Mon Jan 01 2024"), newest first. Empty means today.
    async fn list_attendance(&self, date: &str) -> zbus::fdo::Result<String> {
        let records = self.service.attendance_for(date).await;
        to_json(&records)
    }

    /// Every attendance record as CSV.
    async fn export_attendance(&self) -> zbus::fdo::Result<String> {
        Ok(self.service.export_csv().await)
    }

    /// Delete all attendance records. Returns how many were removed.
    async fn clear_attendance(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("clear attendance requested");
        let removed = self
            .service
            .clear_attendance()
            .await
            .map_err(service_error)?;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    /// Today's enrolled / present / rate figures.
    async fn stats(&self) -> zbus::fdo::Result<String> {
        to_json(&self.service.stats().await)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let running = self.engine.is_running().await;
        let snapshot = self.service.snapshot();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": if running { "running" } else { "stopped" },
            "device": self.config.camera_device,
            "threshold": self.config.similarity_threshold,
            "session": snapshot,
        })
        .to_string())
    }
}

fn rejection_kind(rejection: &CommitRejection) -> &'static str {
    match rejection {
        CommitRejection::SessionStopped => "sessionStopped",
        CommitRejection::NoRecentMatch => "noRecentMatch",
        CommitRejection::DetectionExpired { .. } => "detectionExpired",
        CommitRejection::AlreadyMarked { .. } => "alreadyMarked",
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn engine_error(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::NotRunning
        | EngineError::NoFrame
        | EngineError::NoFaceDetected
        | EngineError::MultipleFaces(_)
        | EngineError::Extract(_) => zbus::fdo::Error::Failed(err.to_string()),
        EngineError::Camera(_) | EngineError::Detector(_) => {
            tracing::warn!(error = %err, "engine unavailable");
            zbus::fdo::Error::IOError(err.to_string())
        }
        EngineError::Thread(_) | EngineError::ChannelClosed => {
            tracing::error!(error = %err, "engine failure");
            zbus::fdo::Error::Failed(err.to_string())
        }
    }
}

fn service_error(err: ServiceError) -> zbus::fdo::Error {
    match err {
        ServiceError::DuplicateIdentity(_) => zbus::fdo::Error::FileExists(err.to_string()),
        ServiceError::InvalidInput(_) => zbus::fdo::Error::InvalidArgs(err.to_string()),
        ServiceError::Store(_) => {
            tracing::warn!(error = %err, "store failure");
            zbus::fdo::Error::IOError(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_kinds() {
        assert_eq!(rejection_kind(&CommitRejection::NoRecentMatch), "noRecentMatch");
        assert_eq!(
            rejection_kind(&CommitRejection::AlreadyMarked {
                name: "Asha".into(),
                at: "9:00:00 AM".into(),
            }),
            "alreadyMarked"
        );
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            service_error(ServiceError::DuplicateIdentity("Priya".into())),
            zbus::fdo::Error::FileExists(_)
        ));
        assert!(matches!(
            engine_error(EngineError::MultipleFaces(2)),
            zbus::fdo::Error::Failed(_)
        ));
    }
}

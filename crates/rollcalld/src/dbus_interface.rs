use crate::state::AppState;
use rollcall_core::{GalleryError, LedgerError, RecognitionError};
use std::path::PathBuf;
use std::sync::Arc;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "io.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/io/rollcall/Attendance1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: io.rollcall.Attendance1
/// Object path: /io/rollcall/Attendance1
pub struct AttendanceService {
    state: Arc<AppState>,
}

impl AttendanceService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Run a blocking operation off the async executor.
    async fn blocking<T, F>(&self, op: F) -> fdo::Result<T>
    where
        F: FnOnce(&AppState) -> fdo::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::task::spawn_blocking(move || op(&state))
            .await
            .map_err(|e| fdo::Error::Failed(format!("worker task failed: {e}")))?
    }
}

#[interface(name = "io.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll a face image for an identity. Returns the gallery size after reload.
    async fn register(&self, identity: String, image_path: String) -> fdo::Result<u32> {
        tracing::info!(identity = %identity, image_path = %image_path, "register requested");
        let path = PathBuf::from(image_path);
        self.blocking(move |state| {
            let size = state.register(&identity, &path).map_err(gallery_error)?;
            Ok(u32::try_from(size).unwrap_or(u32::MAX))
        })
        .await
    }

    /// Start the recognition loop. Already running is not an error.
    async fn start(&self) -> fdo::Result<()> {
        tracing::info!("start requested");
        self.blocking(|state| match state.start() {
            Ok(()) | Err(RecognitionError::AlreadyRunning) => Ok(()),
            Err(e) => Err(fdo::Error::Failed(e.to_string())),
        })
        .await
    }

    /// Stop the recognition loop and wait for the camera to be released.
    async fn stop(&self) -> fdo::Result<()> {
        tracing::info!("stop requested");
        self.blocking(|state| {
            state.stop();
            Ok(())
        })
        .await
    }

    /// All ledger entries as a JSON array.
    async fn list_all(&self) -> fdo::Result<String> {
        self.blocking(|state| {
            let entries = state.list_all().map_err(ledger_error)?;
            serde_json::to_string(&entries).map_err(|e| fdo::Error::Failed(e.to_string()))
        })
        .await
    }

    /// Write the ledger to `destination`. Returns the number of entries written.
    async fn export(&self, destination: String) -> fdo::Result<u32> {
        tracing::info!(destination = %destination, "export requested");
        let destination = PathBuf::from(destination);
        self.blocking(move |state| {
            let count = state.export(&destination).map_err(ledger_error)?;
            Ok(u32::try_from(count).unwrap_or(u32::MAX))
        })
        .await
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> fdo::Result<String> {
        self.blocking(|state| Ok(state.status().to_string())).await
    }
}

fn gallery_error(e: GalleryError) -> fdo::Error {
    match &e {
        GalleryError::Validation(_) | GalleryError::NoImage => fdo::Error::InvalidArgs(e.to_string()),
        GalleryError::ImageNotFound(_) => fdo::Error::FileNotFound(e.to_string()),
        GalleryError::Io { .. } => {
            tracing::error!(error = %e, "registration failed");
            fdo::Error::Failed(e.to_string())
        }
    }
}

fn ledger_error(e: LedgerError) -> fdo::Error {
    match &e {
        LedgerError::Identity(_) => fdo::Error::InvalidArgs(e.to_string()),
        LedgerError::Storage { .. } | LedgerError::Malformed { .. } => {
            tracing::error!(error = %e, "ledger operation failed");
            fdo::Error::Failed(e.to_string())
        }
    }
}

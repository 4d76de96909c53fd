//! Export-lifecycle reconciliation.
//!
//! Three bounded passes over the recorder's export list: request the
//! trailing window for every camera, upload finished exports and delete
//! their source records, and re-submit exports that have sat in progress
//! for over half an hour. No state survives between passes; everything is
//! re-derived from the recorder's list and the bucket's contents, so every
//! pass is safe to re-run.
//!
//! A source record is deleted only after its upload has been verified, or
//! after a replacement request for its window has been accepted. Every
//! other outcome leaves the record in place for a later pass.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{FixedOffset, Utc};
use tracing::{error, info, instrument, warn};

use crate::connectivity::ConnectivityCheck;
use crate::recorder_client::{ExportApi, ExportRecord};
use crate::s3_archiver::ObjectStore;
use crate::storage_key::{parse_time_range, storage_key};
use crate::time_window::TimeWindower;

/// An export is stuck once it has been in progress longer than this.
pub const STUCK_THRESHOLD_SECS: i64 = 1800;

/// Orchestrates the three reconciliation cycles.
pub struct Reconciler<R, S, C> {
    recorder: R,
    store: S,
    gate: C,
    windower: TimeWindower,
    zone: FixedOffset,
    cameras: Vec<String>,
    exports_dir: PathBuf,
}

impl<R, S, C> Reconciler<R, S, C>
where
    R: ExportApi,
    S: ObjectStore,
    C: ConnectivityCheck,
{
    pub fn new(
        recorder: R,
        store: S,
        gate: C,
        zone: FixedOffset,
        cameras: Vec<String>,
        exports_dir: PathBuf,
    ) -> Self {
        Self {
            recorder,
            store,
            gate,
            windower: TimeWindower::new(zone),
            zone,
            cameras,
            exports_dir,
        }
    }

    /// Request the trailing export window for every configured camera.
    ///
    /// A failed request for one camera never blocks the others.
    #[instrument(skip(self))]
    pub async fn run_export_cycle(&self) -> Result<()> {
        let window = self.windower.compute_window(Utc::now());
        info!(
            start = window.start,
            end = window.end,
            "requesting exports for trailing window"
        );

        for camera in &self.cameras {
            match self
                .recorder
                .request_export(camera, window.start, window.end)
                .await
            {
                Ok(()) => {
                    metrics::counter!("archiver.exports.requested").increment(1);
                }
                Err(e) => {
                    metrics::counter!("archiver.exports.request_failed").increment(1);
                    error!(camera = %camera, error = %e, "export request failed");
                }
            }
        }

        Ok(())
    }

    /// Upload every finished export and delete its source record.
    ///
    /// Skipped entirely when the storage endpoint is unreachable.
    /// Per-item failures are isolated; one bad export never aborts the
    /// batch.
    #[instrument(skip(self))]
    pub async fn run_upload_cycle(&self) -> Result<()> {
        if !self.gate.is_reachable().await {
            warn!("storage endpoint unreachable, skipping upload cycle");
            metrics::counter!("archiver.upload_cycles.skipped").increment(1);
            return Ok(());
        }

        let finished = self
            .recorder
            .list_finished_exports()
            .await
            .context("listing finished exports")?;
        info!(count = finished.len(), "found finished exports");

        for export in &finished {
            self.archive_export(export).await;
        }

        Ok(())
    }

    /// Archive one finished export. Deletes the source record only after
    /// the upload has been verified.
    async fn archive_export(&self, export: &ExportRecord) {
        let Some(filename) = file_basename(&export.video_path) else {
            error!(
                id = %export.id,
                path = %export.video_path,
                "export has no usable filename"
            );
            return;
        };
        let local_path = self.exports_dir.join(&filename);

        match tokio::fs::try_exists(&local_path).await {
            Ok(true) => {}
            Ok(false) => {
                // The recorder may still be syncing the file to the
                // shared mount; keep the record and try again next cycle.
                warn!(
                    id = %export.id,
                    path = %local_path.display(),
                    "export file not found"
                );
                return;
            }
            Err(e) => {
                error!(
                    id = %export.id,
                    path = %local_path.display(),
                    error = %e,
                    "cannot stat export file"
                );
                return;
            }
        }

        let key = match storage_key(&filename) {
            Ok(key) => key,
            Err(e) => {
                metrics::counter!("archiver.exports.unmappable").increment(1);
                error!(
                    id = %export.id,
                    error = %e,
                    "cannot derive storage key, skipping upload"
                );
                return;
            }
        };

        info!(id = %export.id, key = %key, "archiving export");

        if let Err(e) = self.store.upload_and_verify(&local_path, &key).await {
            metrics::counter!("archiver.uploads.failed").increment(1);
            error!(
                id = %export.id,
                key = %key,
                error = %e,
                "upload failed, leaving record for next cycle"
            );
            return;
        }
        metrics::counter!("archiver.uploads.completed").increment(1);

        match self.recorder.delete_export(&export.id).await {
            Ok(()) => {
                info!(id = %export.id, "export archived and source record deleted");
            }
            Err(e) => {
                // Safe to leave: the next cycle re-uploads to the same
                // key and retries the delete.
                error!(
                    id = %export.id,
                    error = %e,
                    "failed to delete source record after upload"
                );
            }
        }
    }

    /// Re-submit exports stuck in progress, then delete the stuck records.
    #[instrument(skip(self))]
    pub async fn run_stuck_cycle(&self) -> Result<()> {
        let exports = self
            .recorder
            .list_exports()
            .await
            .context("listing exports")?;
        let now = Utc::now().timestamp();

        let stuck: Vec<&ExportRecord> = exports
            .iter()
            .filter(|e| e.in_progress && now - e.requested_at > STUCK_THRESHOLD_SECS)
            .collect();
        if stuck.is_empty() {
            return Ok(());
        }

        info!(count = stuck.len(), "found stuck exports");

        for export in stuck {
            self.recover_stuck(export).await;
        }

        Ok(())
    }

    /// Re-request one stuck export's window. The stuck record is deleted
    /// only after the replacement request has been accepted.
    async fn recover_stuck(&self, export: &ExportRecord) {
        let Some(filename) = file_basename(&export.video_path) else {
            error!(
                id = %export.id,
                path = %export.video_path,
                "stuck export has no usable filename"
            );
            return;
        };

        let window = match parse_time_range(&filename, &self.zone) {
            Ok(window) => window,
            Err(e) => {
                error!(
                    id = %export.id,
                    error = %e,
                    "cannot recover window for stuck export"
                );
                return;
            }
        };

        if let Err(e) = self
            .recorder
            .request_export(&export.camera, window.start, window.end)
            .await
        {
            metrics::counter!("archiver.stuck.resubmit_failed").increment(1);
            error!(
                id = %export.id,
                camera = %export.camera,
                error = %e,
                "failed to re-submit stuck export"
            );
            return;
        }
        info!(
            id = %export.id,
            camera = %export.camera,
            start = window.start,
            end = window.end,
            "re-submitted stuck export"
        );

        match self.recorder.delete_export(&export.id).await {
            Ok(()) => {
                metrics::counter!("archiver.stuck.recovered").increment(1);
                info!(id = %export.id, "deleted stuck export");
            }
            Err(e) => {
                error!(id = %export.id, error = %e, "failed to delete stuck export");
            }
        }
    }
}

fn file_basename(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder_client::RecorderError;
    use crate::s3_archiver::UploadError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecorderState {
        exports: Mutex<Vec<ExportRecord>>,
        requested: Mutex<Vec<(String, i64, i64)>>,
        deleted: Mutex<Vec<String>>,
        failing_cameras: Mutex<Vec<String>>,
        fail_deletes: AtomicBool,
        list_calls: AtomicU32,
    }

    #[derive(Clone, Default)]
    struct FakeRecorder {
        state: Arc<RecorderState>,
    }

    #[async_trait]
    impl ExportApi for FakeRecorder {
        async fn list_exports(&self) -> Result<Vec<ExportRecord>, RecorderError> {
            self.state.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.state.exports.lock().unwrap().clone())
        }

        async fn request_export(
            &self,
            camera: &str,
            start: i64,
            end: i64,
        ) -> Result<(), RecorderError> {
            if self
                .state
                .failing_cameras
                .lock()
                .unwrap()
                .iter()
                .any(|c| c == camera)
            {
                return Err(RecorderError::Api {
                    status: 500,
                    body: "injected request failure".to_string(),
                });
            }
            self.state
                .requested
                .lock()
                .unwrap()
                .push((camera.to_string(), start, end));
            Ok(())
        }

        async fn delete_export(&self, id: &str) -> Result<(), RecorderError> {
            if self.state.fail_deletes.load(Ordering::SeqCst) {
                return Err(RecorderError::Api {
                    status: 500,
                    body: "injected delete failure".to_string(),
                });
            }
            self.state.deleted.lock().unwrap().push(id.to_string());
            self.state.exports.lock().unwrap().retain(|e| e.id != id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct StoreState {
        uploaded: Mutex<Vec<(PathBuf, String)>>,
        fail_uploads: AtomicBool,
    }

    #[derive(Clone, Default)]
    struct FakeStore {
        state: Arc<StoreState>,
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn upload_and_verify(
            &self,
            local_path: &Path,
            key: &str,
        ) -> Result<(), UploadError> {
            if self.state.fail_uploads.load(Ordering::SeqCst) {
                return Err(UploadError::Upload {
                    key: key.to_string(),
                    reason: "injected upload failure".to_string(),
                });
            }
            self.state
                .uploaded
                .lock()
                .unwrap()
                .push((local_path.to_path_buf(), key.to_string()));
            Ok(())
        }
    }

    #[derive(Clone)]
    struct FakeGate {
        reachable: bool,
    }

    #[async_trait]
    impl ConnectivityCheck for FakeGate {
        async fn is_reachable(&self) -> bool {
            self.reachable
        }
    }

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(330 * 60).unwrap()
    }

    fn record(id: &str, camera: &str, filename: &str) -> ExportRecord {
        ExportRecord {
            id: id.to_string(),
            camera: camera.to_string(),
            video_path: format!("/media/frigate/exports/{filename}"),
            in_progress: false,
            requested_at: Utc::now().timestamp(),
        }
    }

    struct Harness {
        recorder: FakeRecorder,
        store: FakeStore,
        exports_dir: TempDir,
        reconciler: Reconciler<FakeRecorder, FakeStore, FakeGate>,
    }

    fn harness_with_gate(reachable: bool) -> Harness {
        let recorder = FakeRecorder::default();
        let store = FakeStore::default();
        let exports_dir = TempDir::new().unwrap();

        let reconciler = Reconciler::new(
            recorder.clone(),
            store.clone(),
            FakeGate { reachable },
            ist(),
            vec!["roadside".to_string(), "stairs".to_string()],
            exports_dir.path().to_path_buf(),
        );

        Harness {
            recorder,
            store,
            exports_dir,
            reconciler,
        }
    }

    fn harness() -> Harness {
        harness_with_gate(true)
    }

    impl Harness {
        fn add_export(&self, export: ExportRecord) {
            self.recorder.state.exports.lock().unwrap().push(export);
        }

        fn write_export_file(&self, filename: &str) {
            std::fs::write(self.exports_dir.path().join(filename), b"video").unwrap();
        }

        fn uploaded_keys(&self) -> Vec<String> {
            self.store
                .state
                .uploaded
                .lock()
                .unwrap()
                .iter()
                .map(|(_, key)| key.clone())
                .collect()
        }

        fn deleted_ids(&self) -> Vec<String> {
            self.recorder.state.deleted.lock().unwrap().clone()
        }

        fn remaining_ids(&self) -> Vec<String> {
            self.recorder
                .state
                .exports
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.id.clone())
                .collect()
        }
    }

    // -- Cycle A --

    #[tokio::test]
    async fn test_export_cycle_requests_every_camera() {
        let h = harness();
        h.reconciler.run_export_cycle().await.unwrap();

        let requested = h.recorder.state.requested.lock().unwrap().clone();
        assert_eq!(requested.len(), 2);
        assert_eq!(requested[0].0, "roadside");
        assert_eq!(requested[1].0, "stairs");

        // Both cameras get the same grid-aligned window.
        assert_eq!(requested[0].1, requested[1].1);
        assert_eq!(requested[0].2 - requested[0].1, 600);
    }

    #[tokio::test]
    async fn test_export_cycle_isolates_camera_failures() {
        let h = harness();
        h.recorder
            .state
            .failing_cameras
            .lock()
            .unwrap()
            .push("roadside".to_string());

        h.reconciler.run_export_cycle().await.unwrap();

        let requested = h.recorder.state.requested.lock().unwrap().clone();
        assert_eq!(requested.len(), 1);
        assert_eq!(requested[0].0, "stairs");
    }

    // -- Cycle B --

    #[tokio::test]
    async fn test_upload_cycle_uploads_then_deletes() {
        let h = harness();
        let filename = "roadside_20251011_160000-20251011_161000_6t96gi.mp4";
        h.add_export(record("exp-1", "roadside", filename));
        h.write_export_file(filename);

        h.reconciler.run_upload_cycle().await.unwrap();

        assert_eq!(h.uploaded_keys(), vec!["roadside/2025/10/11/16/00M.mp4"]);
        assert_eq!(h.deleted_ids(), vec!["exp-1"]);
        assert!(h.remaining_ids().is_empty());
    }

    #[tokio::test]
    async fn test_upload_cycle_skips_entirely_when_unreachable() {
        let h = harness_with_gate(false);
        let filename = "roadside_20251011_160000-20251011_161000_6t96gi.mp4";
        h.add_export(record("exp-1", "roadside", filename));
        h.write_export_file(filename);

        h.reconciler.run_upload_cycle().await.unwrap();

        assert_eq!(h.recorder.state.list_calls.load(Ordering::SeqCst), 0);
        assert!(h.uploaded_keys().is_empty());
        assert!(h.deleted_ids().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_keeps_the_record() {
        let h = harness();
        h.add_export(record(
            "exp-1",
            "roadside",
            "roadside_20251011_160000-20251011_161000_6t96gi.mp4",
        ));
        // No file written: still syncing from the recorder's mount.

        h.reconciler.run_upload_cycle().await.unwrap();

        assert!(h.uploaded_keys().is_empty());
        assert!(h.deleted_ids().is_empty());
        assert_eq!(h.remaining_ids(), vec!["exp-1"]);
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_the_record() {
        let h = harness();
        let filename = "roadside_20251011_160000-20251011_161000_6t96gi.mp4";
        h.add_export(record("exp-1", "roadside", filename));
        h.write_export_file(filename);
        h.store.state.fail_uploads.store(true, Ordering::SeqCst);

        h.reconciler.run_upload_cycle().await.unwrap();
        assert!(h.deleted_ids().is_empty());
        assert_eq!(h.remaining_ids(), vec!["exp-1"]);

        // The record survives into the next pass, which succeeds.
        h.store.state.fail_uploads.store(false, Ordering::SeqCst);
        h.reconciler.run_upload_cycle().await.unwrap();
        assert_eq!(h.deleted_ids(), vec!["exp-1"]);
    }

    #[tokio::test]
    async fn test_delete_failure_after_upload_keeps_the_record() {
        let h = harness();
        let filename = "roadside_20251011_160000-20251011_161000_6t96gi.mp4";
        h.add_export(record("exp-1", "roadside", filename));
        h.write_export_file(filename);
        h.recorder.state.fail_deletes.store(true, Ordering::SeqCst);

        h.reconciler.run_upload_cycle().await.unwrap();

        assert_eq!(h.uploaded_keys().len(), 1);
        assert_eq!(h.remaining_ids(), vec!["exp-1"]);
    }

    #[tokio::test]
    async fn test_malformed_filename_does_not_block_siblings() {
        let h = harness();
        let good_a = "roadside_20251011_160000-20251011_161000_aaaaaa.mp4";
        let good_b = "stairs_20251011_160000-20251011_161000_bbbbbb.mp4";
        let bad = "garbage.mp4";

        h.add_export(record("exp-a", "roadside", good_a));
        h.add_export(record("exp-bad", "roadside", bad));
        h.add_export(record("exp-b", "stairs", good_b));
        h.write_export_file(good_a);
        h.write_export_file(bad);
        h.write_export_file(good_b);

        h.reconciler.run_upload_cycle().await.unwrap();

        assert_eq!(h.uploaded_keys().len(), 2);
        assert_eq!(h.deleted_ids(), vec!["exp-a", "exp-b"]);
        assert_eq!(h.remaining_ids(), vec!["exp-bad"]);
    }

    #[tokio::test]
    async fn test_upload_cycle_ignores_in_progress_exports() {
        let h = harness();
        let filename = "roadside_20251011_160000-20251011_161000_6t96gi.mp4";
        let mut export = record("exp-1", "roadside", filename);
        export.in_progress = true;
        h.add_export(export);
        h.write_export_file(filename);

        h.reconciler.run_upload_cycle().await.unwrap();

        assert!(h.uploaded_keys().is_empty());
        assert!(h.deleted_ids().is_empty());
    }

    // -- Cycle C --

    fn stuck_record(id: &str, age_secs: i64) -> ExportRecord {
        ExportRecord {
            id: id.to_string(),
            camera: "roadside".to_string(),
            video_path:
                "/media/frigate/exports/roadside_20251013_075000-20251013_080000_6t96gi.mp4"
                    .to_string(),
            in_progress: true,
            requested_at: Utc::now().timestamp() - age_secs,
        }
    }

    #[tokio::test]
    async fn test_stuck_threshold_boundary() {
        let h = harness();
        h.add_export(stuck_record("fresh", 1799));
        h.add_export(stuck_record("stale", 1801));

        h.reconciler.run_stuck_cycle().await.unwrap();

        assert_eq!(h.deleted_ids(), vec!["stale"]);
        assert_eq!(h.remaining_ids(), vec!["fresh"]);
        assert_eq!(h.recorder.state.requested.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_recovery_resubmits_the_original_window() {
        let h = harness();
        h.add_export(stuck_record("stale", 3600));

        h.reconciler.run_stuck_cycle().await.unwrap();

        let requested = h.recorder.state.requested.lock().unwrap().clone();
        assert_eq!(requested.len(), 1);

        let expected_start = ist()
            .with_ymd_and_hms(2025, 10, 13, 7, 50, 0)
            .unwrap()
            .timestamp();
        assert_eq!(requested[0], ("roadside".to_string(), expected_start, expected_start + 600));
    }

    #[tokio::test]
    async fn test_stuck_record_survives_failed_resubmission() {
        let h = harness();
        h.add_export(stuck_record("stale", 3600));
        h.recorder
            .state
            .failing_cameras
            .lock()
            .unwrap()
            .push("roadside".to_string());

        h.reconciler.run_stuck_cycle().await.unwrap();

        assert!(h.deleted_ids().is_empty());
        assert_eq!(h.remaining_ids(), vec!["stale"]);
    }

    #[tokio::test]
    async fn test_stuck_record_with_unparseable_name_is_left_alone() {
        let h = harness();
        let mut export = stuck_record("stale", 3600);
        export.video_path = "/media/frigate/exports/not-an-export-name.mp4".to_string();
        h.add_export(export);

        h.reconciler.run_stuck_cycle().await.unwrap();

        assert!(h.recorder.state.requested.lock().unwrap().is_empty());
        assert!(h.deleted_ids().is_empty());
        assert_eq!(h.remaining_ids(), vec!["stale"]);
    }

    #[tokio::test]
    async fn test_finished_exports_are_never_stuck() {
        let h = harness();
        let mut export = stuck_record("old-but-done", 7200);
        export.in_progress = false;
        h.add_export(export);

        h.reconciler.run_stuck_cycle().await.unwrap();

        assert!(h.deleted_ids().is_empty());
        assert!(h.recorder.state.requested.lock().unwrap().is_empty());
    }
}

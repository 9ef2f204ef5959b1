mod common;

use camino::Utf8Path;
use common::{apo_field, apogee_batch, ctx};
use too::export::{write_active_targets, FLAT_FILE_NAME, STACKED_FILE_NAME};
use too::mask::NoMask;
use too::pipeline::{PipelineParams, TooPipeline};
use too::store::MemoryStore;
use too::TooError;

#[test]
fn active_targets_are_written_once_unless_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8Path::from_path(dir.path()).unwrap().join("out/active.csv");

    let mut pipeline = TooPipeline::new(MemoryStore::new(), PipelineParams::default());
    pipeline
        .run(&apogee_batch(&[(1, 150.0, 2.0), (2, 151.0, 2.0)]), &ctx())
        .unwrap();
    let selection = pipeline.select_active(&ctx(), &apo_field(), &NoMask);
    assert_eq!(selection.targets.len(), 2);

    write_active_targets(&selection.targets, &path, false).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines = text.lines();
    assert!(lines.next().unwrap().starts_with("too_id,fiber_type,catalogid,sdss_id,ra,dec"));
    assert_eq!(lines.count(), 2);

    let err = write_active_targets(&selection.targets, &path, false).unwrap_err();
    assert_eq!(err, TooError::FileExists(path.to_string()));
    write_active_targets(&selection.targets[..1], &path, true).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
}

#[test]
fn identity_diff_files_are_partitioned_by_run_date() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(dir.path()).unwrap();

    let mut pipeline = TooPipeline::new(MemoryStore::new(), PipelineParams::default());
    pipeline.run(&apogee_batch(&[(1, 150.0, 2.0)]), &ctx()).unwrap();
    let (flat, stacked) = pipeline.export_identity_diff(root, &ctx()).unwrap();

    let day = root.join("2023-02-25");
    assert_eq!(flat, day.join(FLAT_FILE_NAME));
    assert_eq!(stacked, day.join(STACKED_FILE_NAME));
    // header plus the single minted member
    assert_eq!(std::fs::read_to_string(&flat).unwrap().lines().count(), 2);
    assert_eq!(std::fs::read_to_string(&stacked).unwrap().lines().count(), 2);
}

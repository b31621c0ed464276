//! Reading a small HTK corpus from disk.

use std::fs;

use hnn_core::{FrameMatrix, LabelKind, LabelSource, ObservationReader, UtteranceLabels};
use hnn_features::{
    FeatureLabelSource, HtkLabelSource, HtkObservationReader, TargetList, write_htk_params,
};

fn frames(rows: usize, cols: usize, offset: f32) -> FrameMatrix {
    let data = (0..rows * cols).map(|i| offset + i as f32).collect();
    FrameMatrix::new(data, rows, cols).expect("frames")
}

#[test]
fn test_two_streams_and_targets() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mfc = dir.path().join("mfc");
    let ivec = dir.path().join("ivec");
    let lab = dir.path().join("lab");
    for d in [&mfc, &ivec, &lab] {
        fs::create_dir(d).expect("mkdir");
    }

    write_htk_params(mfc.join("spk1_u1.mfc"), &frames(4, 3, 0.0), 100_000).expect("write");
    write_htk_params(ivec.join("spk1_u1.ivec"), &frames(4, 2, 100.0), 100_000).expect("write");
    fs::write(lab.join("spk1_u1.lab"), "0 100000 sil\n100000 400000 a\n").expect("write");

    let mut reader = HtkObservationReader::new(&mfc, "mfc");
    assert_eq!(reader.add_stream(&ivec, "ivec"), 1);

    let first = reader.read("spk1_u1", 0).expect("stream 0");
    let second = reader.read("spk1_u1", 1).expect("stream 1");
    assert_eq!(first.frame_count(), 4);
    assert_eq!(first.frames.cols(), 3);
    assert_eq!(second.frames.row(0), &[100.0, 101.0]);

    let targets = TargetList::from_names(["sil", "a"]).expect("targets");
    let mut labels = HtkLabelSource::new(&lab, "lab", targets);
    assert_eq!(labels.kind(), LabelKind::Targets);
    match labels.load("spk1_u1", 4).expect("labels") {
        UtteranceLabels::Targets(t) => assert_eq!(t, vec![0, 1, 1, 1]),
        other => panic!("unexpected labels {other:?}"),
    }

    let mut features = FeatureLabelSource::new(&ivec, "ivec");
    assert_eq!(features.kind(), LabelKind::Features);
    assert_eq!(
        features.load("spk1_u1", 4).expect("features").frame_count(),
        Some(4)
    );
    assert!(features.load("spk1_u1", 5).is_err());
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut reader = HtkObservationReader::new(dir.path(), "mfc");
    assert!(matches!(
        reader.read("absent", 0),
        Err(hnn_core::HnnError::Io(_))
    ));
}

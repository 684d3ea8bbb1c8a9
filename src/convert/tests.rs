use std::{fs, path::Path, thread};

use super::*;
use crate::{
    fabric::LocalFabric,
    report::{legacy, Layout, ReportMetadata, ReportWriter, OFFSET_SENTINEL},
};

/// Routes the pipeline's events through the test harness output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

struct Input {
    uri: String,
    metadata: ReportMetadata,
    layout: Layout,
    frames: Vec<Vec<f32>>,
}

/// Three neurons with counts [[2], [1, 3], [2, 2]] and `stored` frames of
/// a 0..end ms axis.
fn write_input(dir: &Path, end: f64, stored: usize) -> Input {
    init_tracing();
    let metadata = ReportMetadata {
        start: 0.0,
        end,
        step: 1.0,
        data_unit: "mV".into(),
        time_unit: "ms".into(),
    };
    let layout = Layout::contiguous(
        vec![10, 20, 30],
        vec![vec![2], vec![1, 3], vec![2, 2]],
    );
    let frames: Vec<Vec<f32>> = (0..stored)
        .map(|f| {
            (0..10)
                .map(|c| f as f32 * 100.0 - c as f32 * 0.25)
                .collect()
        })
        .collect();
    let path = dir.join("input.bin");
    legacy::fixture::write(&path, &metadata, &layout, &frames);
    Input {
        uri: path.to_str().unwrap().to_string(),
        metadata,
        layout,
        frames,
    }
}

fn output_uri(dir: &Path) -> String {
    dir.join("out.h5").to_str().unwrap().to_string()
}

fn single_rank() -> LocalFabric {
    LocalFabric::world(1).remove(0)
}

/// Runs `config` on every rank of a local world of `size`.
fn convert_on_world(
    config: &ConvertConfig,
    size: usize,
) -> Vec<Result<ConversionSummary>> {
    let ranks: Vec<_> = LocalFabric::world(size)
        .into_iter()
        .map(|fabric| {
            let config = config.clone();
            thread::spawn(move || convert(&config, &fabric))
        })
        .collect();
    ranks.into_iter().map(|rank| rank.join().unwrap()).collect()
}

#[test]
fn single_process_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 10.0, 10);
    let config = ConvertConfig::builder()
        .input(input.uri.clone())
        .output(output_uri(dir.path()))
        .build();

    let summary = convert(&config, &single_rank()).unwrap();
    assert_eq!(summary.frames, 10);
    let line = summary.to_string();
    assert!(line.starts_with(&format!(
        "Converted {} -> {} in ",
        input.uri,
        output_uri(dir.path())
    )));
    assert!(!line.contains(" proc "));

    let output = report::open_reader(&output_uri(dir.path())).unwrap();
    assert_eq!(output.metadata(), &input.metadata);
    assert_eq!(output.layout(), &input.layout);
    for (f, frame) in input.frames.iter().enumerate() {
        assert_eq!(output.load_frame(f as f64).unwrap().as_ref(), Some(frame));
    }
    assert_eq!(output.load_frame(10.0).unwrap(), None);
}

#[test]
fn dump_is_stable_and_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 10.0, 10);
    let reader = report::open_reader(&input.uri).unwrap();

    let mut first = Vec::new();
    dump(&input.uri, reader.as_ref(), &mut first).unwrap();
    let mut second = Vec::new();
    dump(&input.uri, reader.as_ref(), &mut second).unwrap();
    assert_eq!(first, second);

    let text = String::from_utf8(first).unwrap();
    assert_eq!(
        text,
        format!(
            "Compartment report {}:\n  Time: 0..10 / 1 ms\n  3 neurons\n  \
             10 compartments\n",
            input.uri
        )
    );
    let entries = fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(entries, 1);
}

#[test]
fn max_frames_clamps_the_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 10.0, 10);
    let config = ConvertConfig::builder()
        .input(input.uri.clone())
        .output(output_uri(dir.path()))
        .max_frames(4)
        .compare(true)
        .build();

    let summary = convert(&config, &single_rank()).unwrap();
    assert_eq!(summary.frames, 4);

    let output = report::open_reader(&output_uri(dir.path())).unwrap();
    assert_eq!(output.end(), 4.0);
    assert_eq!(output.metadata().frame_count(), 4);
    assert_eq!(
        output.load_frame(3.0).unwrap().as_ref(),
        Some(&input.frames[3])
    );
    assert_eq!(output.load_frame(4.0).unwrap(), None);
}

#[test]
fn clamping_beyond_the_report_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 10.0, 10);
    let config = ConvertConfig::builder()
        .input(input.uri.clone())
        .output(output_uri(dir.path()))
        .max_frames(400)
        .compare(true)
        .build();
    assert_eq!(convert(&config, &single_rank()).unwrap().frames, 10);
}

#[test]
fn two_ranks_partition_and_verify() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 10.0, 10);
    let config = ConvertConfig::builder()
        .input(input.uri.clone())
        .output(output_uri(dir.path()))
        .compare(true)
        .build();

    let summaries: Vec<_> = convert_on_world(&config, 2)
        .into_iter()
        .map(|summary| summary.unwrap())
        .collect();
    let converted: u64 = summaries.iter().map(|s| s.frames).sum();
    assert_eq!(converted, 10);
    assert!(summaries[1]
        .to_string()
        .contains(&format!(" proc 1/2 done {} frames", summaries[1].frames)));

    let output = report::open_reader(&output_uri(dir.path())).unwrap();
    assert_eq!(output.layout(), &input.layout);
    for (f, frame) in input.frames.iter().enumerate() {
        assert_eq!(output.load_frame(f as f64).unwrap().as_ref(), Some(frame));
    }
}

#[test]
fn three_ranks_convert_every_frame() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 10.0, 10);
    let config = ConvertConfig::builder()
        .input(input.uri.clone())
        .output(output_uri(dir.path()))
        .compare(true)
        .build();
    for summary in convert_on_world(&config, 3) {
        summary.unwrap();
    }
}

#[test]
fn scattered_input_sections_convert_and_verify() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let metadata = ReportMetadata {
        start: 0.0,
        end: 3.0,
        step: 0.5,
        data_unit: "mV".into(),
        time_unit: "ms".into(),
    };
    // stored order is gid 2, gid 1, gid 3; gid 2 has an empty section
    let stored = Layout {
        gids: vec![1, 2, 3],
        counts: vec![vec![1], vec![2, 0], vec![1]],
        offsets: vec![vec![2], vec![0, OFFSET_SENTINEL], vec![3]],
        frame_size: 4,
    };
    let frames: Vec<Vec<f32>> = (0..6)
        .map(|f| (0..4).map(|c| (f * 10 + c) as f32).collect())
        .collect();
    let path = dir.path().join("scattered.bin");
    legacy::fixture::write(&path, &metadata, &stored, &frames);
    let config = ConvertConfig::builder()
        .input(path.to_str().unwrap())
        .output(output_uri(dir.path()))
        .compare(true)
        .build();

    for summary in convert_on_world(&config, 2) {
        summary.unwrap();
    }
    let output = report::open_reader(&output_uri(dir.path())).unwrap();
    assert_eq!(
        output.offsets(),
        &[vec![0], vec![1, OFFSET_SENTINEL], vec![3]]
    );
    for (f, raw) in frames.iter().enumerate() {
        let expected = vec![raw[2], raw[0], raw[1], raw[3]];
        let timestamp = metadata.frame_time(f as u64);
        assert_eq!(output.load_frame(timestamp).unwrap(), Some(expected));
    }
}

#[test]
fn too_many_workers_leave_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 4.0, 4);
    let config = ConvertConfig::builder()
        .input(input.uri.clone())
        .output(output_uri(dir.path()))
        .build();

    for result in convert_on_world(&config, 16) {
        assert!(matches!(
            result,
            Err(Error::TooManyWorkers {
                workers: 15,
                prequeue: 2,
                frames: 4
            })
        ));
    }
    assert!(!Path::new(&output_uri(dir.path())).exists());
}

#[test]
fn frames_missing_from_the_input_abort() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 10.0, 5);
    let config = ConvertConfig::builder()
        .input(input.uri.clone())
        .output(output_uri(dir.path()))
        .build();
    assert!(matches!(
        convert(&config, &single_rank()),
        Err(Error::MissingFrame { index: 5, .. })
    ));
}

/// Drops the last compartment of every slice it forwards.
struct Truncating(Box<dyn ReportWriter>);

impl ReportWriter for Truncating {
    fn write_header(
        &mut self,
        metadata: &ReportMetadata,
    ) -> report::Result<()> {
        self.0.write_header(metadata)
    }

    fn declare_gid(&mut self, gid: u32) -> report::Result<()> {
        self.0.declare_gid(gid)
    }

    fn write_compartments(
        &mut self,
        gid: u32,
        counts: &[u16],
    ) -> report::Result<()> {
        self.0.write_compartments(gid, counts)
    }

    fn write_frame(
        &mut self,
        gid: u32,
        voltages: &[f32],
        timestamp: f64,
    ) -> report::Result<()> {
        let short = &voltages[..voltages.len().saturating_sub(1)];
        self.0.write_frame(gid, short, timestamp)
    }

    fn flush(&mut self) -> report::Result<()> {
        self.0.flush()
    }
}

#[test]
fn wrong_slice_sizes_abort_the_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 10.0, 10);
    let reader = report::open_reader(&input.uri).unwrap();
    let options = WriterOptions::builder().overwrite(true).build();
    let inner = report::open_writer(&output_uri(dir.path()), &options);
    let mut writer = Truncating(inner.unwrap());
    writer.write_header(reader.metadata()).unwrap();
    declare_layout(&mut writer, reader.layout(), 0..3).unwrap();

    let fabric = single_rank();
    let mut worker = FrameWorker::new(reader.as_ref(), &mut writer);
    let result = Dispatcher::new(&fabric, 10)
        .unwrap()
        .dispatch(|index| worker.process(index));
    assert!(matches!(
        result,
        Err(Error::Report(report::Error::Size {
            gid: 10,
            expected: 2,
            found: 1
        }))
    ));
}

#[test]
fn verification_catches_altered_voltages() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_input(dir.path(), 10.0, 10);
    let config = ConvertConfig::builder()
        .input(input.uri.clone())
        .output(output_uri(dir.path()))
        .build();
    convert(&config, &single_rank()).unwrap();

    // frames are converted in order, so the first block is frame 0; its
    // voltages follow 12 header bytes and 3 entries of 8 bytes
    let data = dir.path().join("out.h5").join("shard-0000.dat");
    let mut bytes = fs::read(&data).unwrap();
    bytes[36..40].copy_from_slice(&1.5f32.to_le_bytes());
    fs::write(&data, bytes).unwrap();

    let reader = report::open_reader(&input.uri).unwrap();
    let output = report::open_reader(&output_uri(dir.path())).unwrap();
    let result = verify(reader.as_ref(), output.as_ref(), &input.metadata, 10);
    assert!(matches!(result, Err(Error::VerifyMismatch { .. })));

    let clamped = input.metadata.clamped(Some(4));
    assert!(matches!(
        verify(reader.as_ref(), output.as_ref(), &clamped, 4),
        Err(Error::VerifyMismatch { .. })
    ));
}

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::tempdir;

use super::support::{pattern, MemoryStream};
use crate::config::AssemblyConfig;
use crate::error::CoreError;
use crate::file_stream::FileStream;
use crate::segment::SegmentReader;
use crate::stream::StorageStream;
use crate::writer::SequentialWriter;

const MIB: usize = 1024 * 1024;

fn shared_bound(initial: Option<u64>) -> (Arc<Mutex<Option<u64>>>, impl FnMut() -> Option<u64> + Send) {
    let bound = Arc::new(Mutex::new(initial));
    let reader = Arc::clone(&bound);
    (bound, move || *reader.lock().unwrap())
}

#[test]
fn test_unbounded_writes_land_in_destination() {
    let dir = tempdir().unwrap();
    let out = MemoryStream::default();
    let mut writer =
        SequentialWriter::new(Box::new(out.clone()), dir.path().join("scratch"), || None::<u64>)
            .unwrap();

    let data = pattern(100_000, 3);
    writer.write(&data).unwrap();
    assert_eq!(writer.length().unwrap(), 100_000);
    assert_eq!(writer.finalize().unwrap(), 100_000);

    assert_eq!(out.bytes(), data);
    assert!(out.was_closed());
    assert!(writer.is_closed());
}

#[test]
fn test_bytes_past_safe_offset_wait_in_scratch() {
    let dir = tempdir().unwrap();
    let out = MemoryStream::default();
    let (bound, checker) = shared_bound(Some(1000));
    let mut writer =
        SequentialWriter::new(Box::new(out.clone()), dir.path().join("scratch"), checker).unwrap();

    let data = pattern(30_000, 9);
    writer.write(&data).unwrap();
    writer.flush().unwrap();
    assert_eq!(out.bytes(), data[..1000].to_vec());

    *bound.lock().unwrap() = None;
    assert_eq!(writer.finalize().unwrap(), 30_000);
    assert_eq!(out.bytes(), data);
}

#[test]
fn test_reverse_order_segments_assemble_correctly() {
    let dir = tempdir().unwrap();
    let out_path = dir.path().join("video.mp4");
    let target = FileStream::create(&out_path).unwrap();
    let (bound, checker) = shared_bound(Some(0));
    let mut writer =
        SequentialWriter::new(Box::new(target), dir.path().join("video.mp4.tmp"), checker)
            .unwrap();

    // reserve the whole file so every segment offset is reachable
    writer.write(&vec![0u8; 10 * MIB]).unwrap();

    for segment in (0..10u64).rev() {
        writer.seek(segment * MIB as u64).unwrap();
        writer.write(&pattern(MIB, segment as u8)).unwrap();
    }
    *bound.lock().unwrap() = None;

    assert_eq!(writer.finalize().unwrap(), 10 * MIB as u64);

    let written = fs::read(&out_path).unwrap();
    assert_eq!(written.len(), 10 * MIB);
    for segment in 0..10usize {
        assert_eq!(
            &written[segment * MIB..(segment + 1) * MIB],
            pattern(MIB, segment as u8).as_slice(),
            "segment {} differs",
            segment
        );
    }
}

#[test]
fn test_scratch_file_stays_near_threshold() {
    let dir = tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    let threshold = 256 * 1024u64;
    let chunk = 32 * 1024usize;
    let config = AssemblyConfig {
        aux_threshold_bytes: threshold,
        ..AssemblyConfig::default()
    };
    let out = MemoryStream::default();
    let (bound, checker) = shared_bound(Some(0));
    let mut writer =
        SequentialWriter::with_config(Box::new(out.clone()), &scratch, checker, config).unwrap();

    let mut expected = pattern(64 * 1024, 1);
    writer.write(&expected).unwrap();
    *bound.lock().unwrap() = None;

    for index in 0..20u8 {
        let data = pattern(chunk, index);
        writer.write(&data).unwrap();
        expected.extend_from_slice(&data);
        let scratch_size = fs::metadata(&scratch).unwrap().len();
        assert!(
            scratch_size <= threshold + chunk as u64,
            "scratch grew to {} bytes",
            scratch_size
        );
    }

    assert_eq!(writer.finalize().unwrap(), expected.len() as u64);
    assert_eq!(out.bytes(), expected);
}

#[test]
fn test_finalize_twice_returns_same_length() {
    let dir = tempdir().unwrap();
    let out = MemoryStream::default();
    let mut writer =
        SequentialWriter::new(Box::new(out.clone()), dir.path().join("scratch"), || None::<u64>)
            .unwrap();
    writer.write(&pattern(5000, 0)).unwrap();

    let first = writer.finalize().unwrap();
    let second = writer.finalize().unwrap();
    assert_eq!(first, 5000);
    assert_eq!(first, second);
    assert_eq!(out.bytes(), pattern(5000, 0));
}

#[test]
fn test_regressing_offset_checker_fails() {
    let dir = tempdir().unwrap();
    let (bound, checker) = shared_bound(None);
    let mut writer = SequentialWriter::new(
        Box::new(MemoryStream::default()),
        dir.path().join("scratch"),
        checker,
    )
    .unwrap();
    writer.write(&[7u8; 100]).unwrap();

    *bound.lock().unwrap() = Some(50);
    let err = writer.write(&[1u8; 10]).unwrap_err();
    assert!(matches!(err, CoreError::InvalidOffset(_)));
    assert_eq!(writer.length().unwrap(), 100);
}

#[test]
fn test_seek_outside_written_range_fails() {
    let dir = tempdir().unwrap();
    let out = MemoryStream::default();
    let mut writer =
        SequentialWriter::new(Box::new(out.clone()), dir.path().join("scratch"), || None::<u64>)
            .unwrap();
    writer.write(&[1u8; 10]).unwrap();

    let err = writer.seek(11).unwrap_err();
    assert!(matches!(err, CoreError::SeekOutOfRange(_)));

    writer.seek(5).unwrap();
    writer.write(&[9u8; 2]).unwrap();
    assert_eq!(writer.finalize().unwrap(), 10);
    assert_eq!(out.bytes(), vec![1u8, 1, 1, 1, 1, 9, 9, 1, 1, 1]);
}

#[test]
fn test_skip_moves_relative_to_position() {
    let dir = tempdir().unwrap();
    let out = MemoryStream::default();
    let mut writer =
        SequentialWriter::new(Box::new(out.clone()), dir.path().join("scratch"), || None::<u64>)
            .unwrap();
    writer.write(&[1u8; 10]).unwrap();

    writer.seek(4).unwrap();
    assert_eq!(writer.skip(3).unwrap(), 3);
    writer.write(&[7u8; 2]).unwrap();
    assert!(matches!(writer.skip(5), Err(CoreError::SeekOutOfRange(_))));

    assert_eq!(writer.finalize().unwrap(), 10);
    assert_eq!(out.bytes(), vec![1u8, 1, 1, 1, 1, 1, 1, 7, 7, 1]);
}

#[test]
fn test_skip_past_u64_range_fails() {
    let dir = tempdir().unwrap();
    let out = MemoryStream::default();
    let mut writer =
        SequentialWriter::new(Box::new(out.clone()), dir.path().join("scratch"), || None::<u64>)
            .unwrap();
    writer.write(&[1u8; 10]).unwrap();

    assert!(matches!(writer.skip(u64::MAX), Err(CoreError::SeekOutOfRange(_))));
    writer.write(&[2u8; 2]).unwrap();
    assert_eq!(writer.finalize().unwrap(), 12);
    assert_eq!(out.bytes(), vec![1u8, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2]);
}

#[test]
fn test_reads_are_rejected() {
    let dir = tempdir().unwrap();
    let mut writer = SequentialWriter::new(
        Box::new(MemoryStream::default()),
        dir.path().join("scratch"),
        || None::<u64>,
    )
    .unwrap();
    let mut buf = [0u8; 4];

    assert!(!writer.can_read());
    assert!(matches!(writer.read(&mut buf), Err(CoreError::Unsupported(_))));
    assert!(matches!(writer.available(), Err(CoreError::Unsupported(_))));
}

#[test]
fn test_rewind_rolls_back_progress() {
    let dir = tempdir().unwrap();
    let out = MemoryStream::default();
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let mut writer =
        SequentialWriter::new(Box::new(out.clone()), dir.path().join("scratch"), || None::<u64>)
            .unwrap();
    writer.set_progress(move |position: u64| sink.lock().unwrap().push(position));

    writer.write(&pattern(100 * 1024, 0)).unwrap();
    writer.rewind().unwrap();
    writer.write(&[0xAAu8; 10]).unwrap();

    assert_eq!(*reports.lock().unwrap(), vec![102_400, 0]);
    assert_eq!(writer.finalize().unwrap(), 100 * 1024);
    let bytes = out.bytes();
    assert_eq!(&bytes[..10], &[0xAAu8; 10]);
    assert_eq!(&bytes[10..], &pattern(100 * 1024, 0)[10..]);
}

#[test]
fn test_progress_reported_every_interval() {
    let dir = tempdir().unwrap();
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let mut writer = SequentialWriter::new(
        Box::new(MemoryStream::default()),
        dir.path().join("scratch"),
        || None::<u64>,
    )
    .unwrap();
    writer.set_progress(move |position: u64| sink.lock().unwrap().push(position));

    for index in 0..10u8 {
        writer.write(&pattern(16 * 1024, index)).unwrap();
    }

    assert_eq!(*reports.lock().unwrap(), vec![81_920, 163_840]);
}

#[test]
fn test_write_error_handler_retries() {
    let dir = tempdir().unwrap();
    let out = MemoryStream::default();
    out.fail_next_writes(2);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut writer =
        SequentialWriter::new(Box::new(out.clone()), dir.path().join("scratch"), || None::<u64>)
            .unwrap();
    writer.set_write_error_handler(move |_err: &CoreError| {
        counter.fetch_add(1, Ordering::SeqCst);
        true
    });

    let data = pattern(20_000, 4);
    writer.write(&data).unwrap();
    assert_eq!(writer.finalize().unwrap(), 20_000);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(out.bytes(), data);
}

#[test]
fn test_declined_write_error_leaves_state_untouched() {
    let dir = tempdir().unwrap();
    let out = MemoryStream::default();
    out.fail_next_writes(1);
    let mut writer =
        SequentialWriter::new(Box::new(out.clone()), dir.path().join("scratch"), || None::<u64>)
            .unwrap();
    writer.set_write_error_handler(|_err: &CoreError| false);

    let data = pattern(20_000, 5);
    let err = writer.write(&data).unwrap_err();
    assert!(matches!(err, CoreError::Io(_)));
    assert_eq!(writer.length().unwrap(), 0);

    writer.write(&data).unwrap();
    assert_eq!(writer.finalize().unwrap(), 20_000);
    assert_eq!(out.bytes(), data);
}

#[test]
fn test_partial_drain_keeps_remaining_scratch_bytes() {
    let dir = tempdir().unwrap();
    let out = MemoryStream::default();
    let (bound, checker) = shared_bound(Some(0));
    let mut writer =
        SequentialWriter::new(Box::new(out.clone()), dir.path().join("scratch"), checker).unwrap();

    let data = pattern(100, 2);
    writer.write(&data).unwrap();
    writer.flush_auxiliary(40).unwrap();
    assert_eq!(out.bytes(), data[..40].to_vec());
    assert_eq!(writer.length().unwrap(), 100);

    *bound.lock().unwrap() = None;
    writer.write(&[0xFFu8; 5]).unwrap();
    assert_eq!(writer.finalize().unwrap(), 105);

    let mut expected = data.clone();
    expected.extend_from_slice(&[0xFFu8; 5]);
    assert_eq!(out.bytes(), expected);
}

#[test]
fn test_empty_write_skips_offset_checker() {
    let dir = tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut writer = SequentialWriter::new(
        Box::new(MemoryStream::default()),
        dir.path().join("scratch"),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            None::<u64>
        },
    )
    .unwrap();

    writer.write(&[]).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(writer.length().unwrap(), 0);
}

#[test]
fn test_unseekable_destination_is_rejected_and_closed() {
    let dir = tempdir().unwrap();
    let source = MemoryStream::with_bytes(vec![0u8; 10]);
    let reader = SegmentReader::new(Box::new(source.clone()), 0, 10).unwrap();

    let err = SequentialWriter::new(Box::new(reader), dir.path().join("scratch"), || None::<u64>)
        .unwrap_err();
    assert!(matches!(err, CoreError::Unsupported(_)));
    assert!(source.was_closed());
}

#[test]
fn test_scratch_paths_are_unique() {
    let dir = tempdir().unwrap();
    let first = crate::writer::scratch_path_in(dir.path());
    let second = crate::writer::scratch_path_in(dir.path());

    assert_ne!(first, second);
    assert_eq!(first.parent(), Some(dir.path()));
    assert!(first.extension().map(|ext| ext == "tmp").unwrap_or(false));
}

#[test]
fn test_failed_scratch_compaction_poisons_writer() {
    let dir = tempdir().unwrap();
    let out = MemoryStream::default();
    let scratch = MemoryStream::default();
    let config = AssemblyConfig {
        queue_buffer_size: 4,
        copy_buffer_size: 4,
        aux_threshold_bytes: 8,
        ..AssemblyConfig::default()
    };
    let mut writer = SequentialWriter::from_streams(
        Box::new(out.clone()),
        Box::new(scratch.clone()),
        dir.path().join("scratch"),
        || Some(0u64),
        config,
    );

    let data = pattern(12, 3);
    writer.write(&data).unwrap();
    writer.flush().unwrap();
    assert_eq!(scratch.bytes(), data);

    scratch.fail_next_writes(1);
    let err = writer.flush_auxiliary(4).unwrap_err();
    assert!(matches!(err, CoreError::Io(_)));
    assert_eq!(out.bytes(), data[..4].to_vec());

    assert!(matches!(writer.write(&[1u8]), Err(CoreError::InvalidState(_))));
    assert!(matches!(writer.seek(0), Err(CoreError::InvalidState(_))));
    assert!(matches!(writer.length(), Err(CoreError::InvalidState(_))));
    assert!(matches!(writer.finalize(), Err(CoreError::InvalidState(_))));

    writer.close();
    assert!(out.was_closed());
    assert!(scratch.was_closed());
}

#[test]
fn test_failed_drain_copy_rolls_back() {
    let dir = tempdir().unwrap();
    let out = MemoryStream::default();
    let scratch = MemoryStream::default();
    let config = AssemblyConfig {
        queue_buffer_size: 4,
        copy_buffer_size: 4,
        aux_threshold_bytes: 8,
        ..AssemblyConfig::default()
    };
    let (bound, checker) = shared_bound(Some(0));
    let mut writer = SequentialWriter::from_streams(
        Box::new(out.clone()),
        Box::new(scratch.clone()),
        dir.path().join("scratch"),
        checker,
        config,
    );

    let first = pattern(6, 1);
    writer.write(&first).unwrap();
    *bound.lock().unwrap() = Some(100);
    out.fail_next_writes(1);
    let second = pattern(4, 9);
    assert!(matches!(writer.write(&second), Err(CoreError::Io(_))));
    assert_eq!(writer.length().unwrap(), 6);

    writer.write(&second).unwrap();
    assert_eq!(writer.finalize().unwrap(), 10);
    let mut expected = first.clone();
    expected.extend_from_slice(&second);
    assert_eq!(out.bytes(), expected);
}

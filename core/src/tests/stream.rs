use std::fs;
use std::io::Cursor;

use tempfile::tempdir;
use url::Url;

use crate::document::{Descriptor, DocumentStream};
use crate::error::CoreError;
use crate::file_stream::FileStream;
use crate::stream::StorageStream;

#[test]
fn test_file_stream_random_access() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.bin");
    let mut stream = FileStream::create(&path).unwrap();

    stream.write(b"hello world").unwrap();
    stream.seek(6).unwrap();
    stream.write(b"there").unwrap();
    assert_eq!(stream.length().unwrap(), 11);

    stream.rewind().unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(stream.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    assert_eq!(stream.available().unwrap(), 6);
    assert_eq!(stream.skip(100).unwrap(), 6);
    assert_eq!(stream.read(&mut buf).unwrap(), 0);

    stream.set_length(5).unwrap();
    stream.close();
    stream.close();
    assert!(stream.is_closed());
    assert!(matches!(stream.write(b"x"), Err(CoreError::Closed)));
    assert_eq!(fs::read(&path).unwrap(), b"hello");
}

#[test]
fn test_file_stream_open_requires_existing_file() {
    let dir = tempdir().unwrap();
    let err = FileStream::open(dir.path().join("missing.bin")).unwrap_err();
    assert!(matches!(err, CoreError::Io(_)));
}

#[test]
fn test_document_stream_shrinks_but_never_grows() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("doc.bin");
    fs::write(&path, vec![5u8; 32]).unwrap();
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let uri = Url::parse("content://spool.test/tree/primary%3A/document/primary%3Adoc.bin").unwrap();
    let mut stream = DocumentStream::acquire(Descriptor::ReadWrite(file), uri).unwrap();

    assert!(stream.can_seek());
    assert!(stream.can_set_length());
    stream.set_length(16).unwrap();
    assert_eq!(stream.length().unwrap(), 16);
    assert!(matches!(stream.set_length(64), Err(CoreError::Unsupported(_))));

    stream.seek(16).unwrap();
    stream.write(&[1u8; 16]).unwrap();
    stream.flush().unwrap();
    assert_eq!(stream.length().unwrap(), 32);
}

#[test]
fn test_stream_only_descriptor_is_rejected() {
    let uri = Url::parse("content://spool.test/document/pipe").unwrap();
    let descriptor = Descriptor::StreamOnly(Box::new(Cursor::new(vec![0u8; 4])));

    let err = DocumentStream::acquire(descriptor, uri).unwrap_err();
    assert!(matches!(err, CoreError::Unsupported(_)));
}

#[test]
fn test_read_only_file_stream_reports_capabilities() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("input.bin");
    fs::write(&path, b"abcdef").unwrap();

    let mut stream = FileStream::open_read_only(&path).unwrap();
    assert!(!stream.can_write());
    assert!(!stream.can_set_length());
    assert!(stream.can_seek());
    stream.seek(3).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(stream.read(&mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"def");
}

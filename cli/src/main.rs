use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use spool_core::checksum::{segment_digest, verify_segment, ChecksumRequest, ChecksumType};
use spool_core::grants::{MemoryPermissionStore, PermissionStore, SqlitePermissionStore};
use spool_core::local_provider::LocalDocumentProvider;
use spool_core::writer::scratch_path_in;
use spool_core::{
    AssemblyConfig, CoreError, FileStream, SegmentReader, SequentialWriter, StorageContext,
    StorageDirectory, StorageStream,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

const DOCUMENTS_AUTHORITY: &str = "spool.local";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let result = match args[1].as_str() {
        "unique" => run_unique(&args[2..]),
        "join" => run_join(&args[2..]),
        "checksum" => run_checksum(&args[2..]),
        "grants" => run_grants(),
        _ => {
            print_usage();
            Ok(())
        }
    };
    if let Err(err) = result {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn build_config() -> AssemblyConfig {
    let mut config = AssemblyConfig::default();
    if let Some(threshold) = env::var("SPOOL_AUX_THRESHOLD")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.aux_threshold_bytes = threshold;
    }
    config
}

fn build_context() -> Result<StorageContext, CoreError> {
    let mut ctx = StorageContext::new(build_config());

    let grants: Box<dyn PermissionStore> = match env::var("SPOOL_GRANTS_DB") {
        Ok(path) => Box::new(SqlitePermissionStore::new(path)?),
        Err(_) => Box::new(MemoryPermissionStore::default()),
    };
    ctx = ctx.with_grants(grants);

    if let Ok(root) = env::var("SPOOL_DOCUMENTS_ROOT") {
        let provider = LocalDocumentProvider::new(DOCUMENTS_AUTHORITY).with_root("primary", root);
        provider.grant_tree("primary:");
        ctx = ctx.with_provider(Arc::new(provider));
    }
    Ok(ctx)
}

/// Accepts either a `content://` tree or a local directory path.
fn open_directory(ctx: &StorageContext, arg: &str) -> Result<StorageDirectory, CoreError> {
    let uri = match Url::parse(arg) {
        Ok(uri) if uri.scheme().len() > 1 => uri,
        _ => {
            let path = fs::canonicalize(arg).map_err(|err| CoreError::Io(format!("{}: {}", arg, err)))?;
            Url::from_directory_path(&path)
                .map_err(|_| CoreError::InvalidState(format!("not a directory: {}", arg)))?
        }
    };
    let directory = StorageDirectory::open(ctx.clone(), &uri, Some("cli".to_string()))?;
    if !directory.mkdirs() {
        return Err(CoreError::NotFound(format!("cannot create {}", arg)));
    }
    Ok(directory)
}

fn run_unique(args: &[String]) -> Result<(), CoreError> {
    let (Some(dir), Some(name)) = (args.first(), args.get(1)) else {
        print_usage();
        return Ok(());
    };
    let ctx = build_context()?;
    let directory = open_directory(&ctx, dir)?;
    let location = directory.create_unique_file(name, args.get(2).map(|value| value.as_str()))?;
    let record = serde_json::to_string_pretty(&location.to_record())
        .map_err(|err| CoreError::InvalidState(err.to_string()))?;
    println!("{}", record);
    Ok(())
}

/// Joins `parts` into a new file. A part only becomes safe to commit once it was read in
/// full; until then its bytes wait in the scratch file.
fn run_join(args: &[String]) -> Result<(), CoreError> {
    if args.len() < 3 {
        print_usage();
        return Ok(());
    }
    let ctx = build_context()?;
    let directory = open_directory(&ctx, &args[0])?;
    let location = directory.create_unique_file(&args[1], None)?;
    let parts: Vec<PathBuf> = args[2..].iter().map(PathBuf::from).collect();

    let scratch = scratch_path();
    let safe_offset = Arc::new(AtomicU64::new(0));
    let checker_offset = Arc::clone(&safe_offset);
    let mut writer = SequentialWriter::with_config(
        location.stream()?,
        &scratch,
        move || Some(checker_offset.load(Ordering::SeqCst)),
        ctx.config().clone(),
    )?;
    writer.set_progress(|position: u64| info!(position, "assembled"));
    writer.set_write_error_handler(|err: &CoreError| {
        eprintln!("write failed: {}", err);
        false
    });

    let result = copy_parts(&mut writer, &parts, &safe_offset, ctx.config().copy_buffer_size)
        .and_then(|_| writer.finalize());
    let _ = fs::remove_file(&scratch);
    let length = match result {
        Ok(length) => length,
        Err(err) => {
            writer.close();
            location.delete();
            return Err(err);
        }
    };

    println!("{}\t{} bytes", location.uri()?, length);
    Ok(())
}

fn copy_parts(
    writer: &mut SequentialWriter,
    parts: &[PathBuf],
    safe_offset: &AtomicU64,
    chunk_size: usize,
) -> Result<(), CoreError> {
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut committed = 0u64;
    for part in parts {
        let mut input = FileStream::open_read_only(part)?;
        loop {
            let read = input.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            writer.write(&buffer[..read])?;
        }
        committed = writer.length()?;
        safe_offset.store(committed, Ordering::SeqCst);
        input.close();
        info!(part = %part.display(), committed, "part copied");
    }
    safe_offset.store(committed, Ordering::SeqCst);
    Ok(())
}

fn scratch_path() -> PathBuf {
    let dir = env::var("SPOOL_SCRATCH_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir());
    scratch_path_in(&dir)
}

fn run_checksum(args: &[String]) -> Result<(), CoreError> {
    if args.len() < 4 {
        print_usage();
        return Ok(());
    }
    let parse = |value: &str| {
        value
            .parse::<u64>()
            .map_err(|_| CoreError::InvalidRange(format!("not an offset: {}", value)))
    };
    let start = parse(&args[1])?;
    let end = parse(&args[2])?;
    let kind = ChecksumType::from_str(&args[3])
        .ok_or_else(|| CoreError::Unsupported(format!("checksum type {}", args[3])))?;

    let source = FileStream::open_read_only(Path::new(&args[0]))?;
    let config = build_config();
    let mut reader = SegmentReader::new(Box::new(source), start, end)?
        .with_report_interval(config.segment_report_interval_bytes);
    reader.set_progress(|position: u64| info!(position, "hashed"));

    match args.get(4) {
        Some(expected) => {
            let request = ChecksumRequest {
                checksum_type: kind,
                expected_hex: expected.to_string(),
            };
            let matches = verify_segment(&mut reader, &request)?;
            println!("{}", if matches { "ok" } else { "mismatch" });
            if !matches {
                std::process::exit(2);
            }
        }
        None => println!("{}  {}", segment_digest(&mut reader, kind)?, kind.as_str()),
    }
    reader.close();
    Ok(())
}

fn run_grants() -> Result<(), CoreError> {
    let Ok(path) = env::var("SPOOL_GRANTS_DB") else {
        eprintln!("SPOOL_GRANTS_DB is not set, no grants are persisted");
        return Ok(());
    };
    let store = SqlitePermissionStore::new(path)?;
    for grant in store.list()? {
        let line = serde_json::to_string(&grant).map_err(|err| CoreError::InvalidState(err.to_string()))?;
        println!("{}", line);
    }
    Ok(())
}

fn print_usage() {
    eprintln!(
        "Usage: spool <command> [args]\n\
Commands:\n\
  unique <dir> <name> [mime]                 Create a file with a free name\n\
  join <dir> <name> <part>...                Assemble parts into a new file\n\
  checksum <file> <start> <end> <type> [hex] Hash a byte range (md5, sha1, sha256)\n\
  grants                                     List persisted grants\n\
Environment:\n\
  SPOOL_GRANTS_DB=/path/to/db   Persist grants in SQLite\n\
  SPOOL_DOCUMENTS_ROOT=/path    Serve a directory as content://spool.local/tree/primary%3A\n\
  SPOOL_SCRATCH_DIR             Where scratch files go (default: temp dir)\n\
  SPOOL_AUX_THRESHOLD           Scratch size in bytes before draining"
    );
}

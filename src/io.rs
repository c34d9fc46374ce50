// File-level helpers around the sync engine.
//
// `write_signature`, `write_delta` and `apply_delta_file` are the three
// halves of a remote sync run through files of frames; `sync_file` does all
// of it locally. Output goes to a temporary sibling that is renamed into
// place, except when rewriting in place. With the `file-io` feature the
// stats carry SHA-256 checksums of what was read and written.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

#[cfg(feature = "file-io")]
use sha2::Digest;
#[cfg(feature = "file-io")]
use std::io::Read;

use crate::engine::{self, SyncOptions};
use crate::error::{Result, SyncError};
use crate::hash::matching::MatchStats;
use crate::hash::table::HashIndex;
use crate::reconstruct::{ApplyStats, InPlaceReconstructor, Reconstructor};
use crate::source::FileSource;
use crate::stream::DeltaSink;
use crate::wire::{Frame, FrameReader, FrameWriter, StreamInfo, SyncFlags};

const BUF_SIZE: usize = 64 * 1024; // 64 KiB

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Statistics returned by `write_signature()`.
#[derive(Debug, Clone)]
pub struct SignatureStats {
    pub target_exists: bool,
    pub target_size: u64,
    pub block_len: u32,
    pub blocks: u64,
    /// Signature file size in bytes.
    pub signature_size: u64,
    /// SHA-256 of the target file (if `file-io` feature is enabled).
    pub target_sha256: Option<[u8; 32]>,
}

/// Statistics returned by `write_delta()`.
#[derive(Debug, Clone)]
pub struct DeltaStats {
    pub source_size: u64,
    pub block_len: u32,
    pub flags: SyncFlags,
    /// Delta file size in bytes.
    pub delta_size: u64,
    pub matched: MatchStats,
    /// SHA-256 of the source file (if `file-io` feature is enabled).
    pub source_sha256: Option<[u8; 32]>,
}

/// Statistics returned by `apply_delta_file()` and `sync_file()`.
#[derive(Debug, Clone)]
pub struct PatchStats {
    pub in_place: bool,
    pub applied: ApplyStats,
    /// SHA-256 of the rebuilt file (if `file-io` feature is enabled).
    pub output_sha256: Option<[u8; 32]>,
}

/// Statistics returned by `sync_file()`.
#[derive(Debug, Clone)]
pub struct SyncStats {
    pub source_size: u64,
    pub rounds: usize,
    pub matched: MatchStats,
    pub patch: PatchStats,
}

// ---------------------------------------------------------------------------
// Paths and checksums
// ---------------------------------------------------------------------------

/// Hidden sibling used while an output file is being written.
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".into());
    path.with_file_name(format!(".{name}.blocksync-tmp"))
}

/// Write through `produce` into a temporary sibling of `dest`, then rename.
fn write_atomically<T>(dest: &Path, produce: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
    let tmp = temp_sibling(dest);
    match fs::remove_file(&tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(SyncError::io(tmp.display().to_string(), e)),
    }
    let out = match produce(&tmp) {
        Ok(out) => out,
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
    };
    fs::rename(&tmp, dest).map_err(|e| SyncError::io(dest.display().to_string(), e))?;
    Ok(out)
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    let f = File::create(path).map_err(|e| SyncError::io(path.display().to_string(), e))?;
    Ok(BufWriter::with_capacity(BUF_SIZE, f))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let f = File::open(path).map_err(|e| SyncError::io(path.display().to_string(), e))?;
    Ok(BufReader::with_capacity(BUF_SIZE, f))
}

fn file_len(path: &Path) -> Result<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| SyncError::io(path.display().to_string(), e))
}

#[cfg(feature = "file-io")]
fn sha256_file(path: &Path) -> Result<Option<[u8; 32]>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = open(path)?;
    let mut hasher = sha2::Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| SyncError::io(path.display().to_string(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Some(hasher.finalize().into()))
}

#[cfg(not(feature = "file-io"))]
fn sha256_file(_path: &Path) -> Result<Option<[u8; 32]>> {
    Ok(None)
}

// ---------------------------------------------------------------------------
// Signature and delta files
// ---------------------------------------------------------------------------

/// Hash `target` into a signature file of frames.
///
/// A missing target still produces a valid (empty) signature.
pub fn write_signature(target: &Path, sig: &Path, opts: &SyncOptions) -> Result<SignatureStats> {
    opts.validate()?;
    let summary = write_atomically(sig, |tmp| {
        let mut writer = FrameWriter::new(create(tmp)?).with_flags(opts.flags());
        let mut reader = FileSource::new(target);
        let summary = engine::hash_stream(&mut reader, &mut writer, opts)?;
        writer.into_inner()?;
        Ok(summary)
    })?;
    Ok(SignatureStats {
        target_exists: summary.exists,
        target_size: summary.size,
        block_len: summary.block_len,
        blocks: summary.blocks,
        signature_size: file_len(sig)?,
        target_sha256: sha256_file(target)?,
    })
}

/// Read a signature file into a hash index.
pub fn read_signature(sig: &Path) -> Result<(HashIndex, StreamInfo)> {
    let mut index = HashIndex::new(0);
    let info = FrameReader::new(open(sig)?).replay_hashes(&mut index)?;
    Ok((index, info))
}

/// Scan `source` against a signature, writing a delta file of frames.
pub fn write_delta(
    sig: &Path,
    source: &Path,
    delta: &Path,
    opts: &SyncOptions,
) -> Result<DeltaStats> {
    opts.validate()?;
    let (index, info) = read_signature(sig)?;
    log::debug!(
        "signature for {}: {} blocks of {} bytes",
        info.name,
        index.len(),
        index.block_len()
    );
    let flags = opts.flags() - SyncFlags::MULTIROUND;
    let matched = write_atomically(delta, |tmp| {
        let mut writer = FrameWriter::new(create(tmp)?).with_flags(flags);
        let mut reader = FileSource::new(source);
        let matched = engine::generate_delta(&mut reader, &index, &mut writer, opts)?;
        writer.into_inner()?;
        Ok(matched)
    })?;
    Ok(DeltaStats {
        source_size: file_len(source)?,
        block_len: index.block_len(),
        flags,
        delta_size: file_len(delta)?,
        matched,
        source_sha256: sha256_file(source)?,
    })
}

/// Header of a delta file, without replaying it.
pub fn delta_info(delta: &Path) -> Result<StreamInfo> {
    match FrameReader::new(open(delta)?).read_frame()? {
        Some(Frame::DeltaBegin {
            name,
            block_len,
            flags,
        }) => Ok(StreamInfo {
            name,
            block_len,
            flags,
        }),
        Some(Frame::Error { code, message }) => Err(SyncError::from_code(code, message)),
        Some(other) => Err(SyncError::Frame(format!(
            "{} starts with a {:?} frame",
            delta.display(),
            other.frame_type()
        ))),
        None => Err(SyncError::Frame(format!("{} is empty", delta.display()))),
    }
}

/// Apply a delta file to `target`.
///
/// With `output` the result is written there; without it the target is
/// rewritten in place, which the delta must have been generated for.
pub fn apply_delta_file(target: &Path, delta: &Path, output: Option<&Path>) -> Result<PatchStats> {
    let info = delta_info(delta)?;
    let in_place = output.is_none();
    if in_place && !info.flags.contains(SyncFlags::IN_PLACE) {
        return Err(SyncError::protocol(format!(
            "{} was not generated for in-place application",
            delta.display()
        )));
    }

    let mut frames = FrameReader::new(open(delta)?);
    let (applied, written) = match output {
        None => {
            let mut sink = InPlaceReconstructor::new(FileSource::read_write(target));
            frames.replay_delta(&mut sink)?;
            (sink.stats(), target.to_path_buf())
        }
        Some(out) => {
            let applied = write_atomically(out, |tmp| {
                let mut sink =
                    Reconstructor::new(FileSource::new(target), FileSource::read_write(tmp));
                frames.replay_delta(&mut sink)?;
                Ok(sink.stats())
            })?;
            (applied, out.to_path_buf())
        }
    };
    log::debug!(
        "{}: {} equal bytes, {} diff bytes",
        written.display(),
        applied.equal_bytes,
        applied.diff_bytes
    );
    Ok(PatchStats {
        in_place,
        applied,
        output_sha256: sha256_file(&written)?,
    })
}

// ---------------------------------------------------------------------------
// Local sync
// ---------------------------------------------------------------------------

/// Bring `target` up to date with `source` on one machine.
///
/// Without `output`, `target` is rewritten in place and in-place ordering is
/// forced on.
pub fn sync_file(
    target: &Path,
    source: &Path,
    output: Option<&Path>,
    opts: &SyncOptions,
) -> Result<SyncStats> {
    let mut opts = *opts;
    if output.is_none() {
        opts.in_place = true;
    }
    opts.validate()?;

    let (source_size, rounds, matched, applied) = match output {
        None => {
            let index = engine::build_index(&mut FileSource::new(target), &opts)?;
            let mut sink = InPlaceReconstructor::new(FileSource::read_write(target));
            let matched =
                engine::generate_delta(&mut FileSource::new(source), &index, &mut sink, &opts)?;
            (file_len(source)?, 1, matched, sink.stats())
        }
        Some(out) => write_atomically(out, |tmp| {
            let mut sink = Reconstructor::new(FileSource::new(target), FileSource::read_write(tmp));
            let row = run_local(target, source, &mut sink, &opts)?;
            Ok((row.0, row.1, row.2, sink.stats()))
        })?,
    };
    let written = output.unwrap_or(target);
    Ok(SyncStats {
        source_size,
        rounds,
        matched,
        patch: PatchStats {
            in_place: output.is_none(),
            applied,
            output_sha256: sha256_file(written)?,
        },
    })
}

fn run_local<S: DeltaSink>(
    target: &Path,
    source: &Path,
    sink: &mut S,
    opts: &SyncOptions,
) -> Result<(u64, usize, MatchStats)> {
    let mut src = FileSource::new(source);
    if opts.multiround {
        let report = engine::run_multiround(&mut FileSource::new(target), &mut src, sink, opts)?;
        let matched = MatchStats {
            lookups: report.lookups(),
            equal_blocks: report.matched_blocks(),
            diff_records: report.diff_records,
            diff_bytes: report.diff_bytes,
            ..Default::default()
        };
        return Ok((report.source_size, report.rounds.len().max(1), matched));
    }
    let index = engine::build_index(&mut FileSource::new(target), opts)?;
    let matched = engine::generate_delta(&mut src, &index, sink, opts)?;
    Ok((file_len(source)?, 1, matched))
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// One object of a batch sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub target: PathBuf,
    pub source: PathBuf,
    /// `None` rewrites `target` in place.
    pub output: Option<PathBuf>,
}

/// Sync independent objects. A failure affects only its own job.
pub fn sync_many(jobs: &[SyncJob], opts: &SyncOptions) -> Vec<Result<SyncStats>> {
    let run = |job: &SyncJob| {
        let res = sync_file(&job.target, &job.source, job.output.as_deref(), opts);
        if let Err(e) = &res {
            log::warn!("{}: {e}", job.source.display());
        }
        res
    };
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        jobs.par_iter().map(run).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        jobs.iter().map(run).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus(len: usize, seed: u64) -> Vec<u8> {
        let mut s = seed;
        (0..len)
            .map(|_| {
                s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (s >> 33) as u8
            })
            .collect()
    }

    fn edited(base: &[u8]) -> Vec<u8> {
        let mut out = base.to_vec();
        out[3000..3010].copy_from_slice(b"0123456789");
        out.splice(9000..9000, b"inserted".iter().copied());
        out.truncate(out.len() - 500);
        out
    }

    #[test]
    fn signature_delta_patch_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("old.bin");
        let source = dir.path().join("new.bin");
        let old = corpus(20_000, 1);
        let new = edited(&old);
        fs::write(&target, &old).unwrap();
        fs::write(&source, &new).unwrap();

        let sig = dir.path().join("old.sig");
        let delta = dir.path().join("new.delta");
        let out = dir.path().join("out.bin");
        let opts = SyncOptions::default();

        let s = write_signature(&target, &sig, &opts).unwrap();
        assert!(s.target_exists);
        assert!(s.blocks > 0);
        let d = write_delta(&sig, &source, &delta, &opts).unwrap();
        assert!(d.matched.equal_blocks > 0);
        assert!(d.delta_size < new.len() as u64);
        apply_delta_file(&target, &delta, Some(&out)).unwrap();
        assert_eq!(fs::read(&out).unwrap(), new);
        assert!(!temp_sibling(&out).exists());
    }

    #[test]
    fn in_place_delta_rewrites_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("old.bin");
        let source = dir.path().join("new.bin");
        let old = corpus(12_000, 2);
        let mut new = old[6_000..].to_vec();
        new.extend_from_slice(&old[..6_000]);
        fs::write(&target, &old).unwrap();
        fs::write(&source, &new).unwrap();

        let sig = dir.path().join("old.sig");
        let delta = dir.path().join("new.delta");
        let opts = SyncOptions {
            in_place: true,
            ..Default::default()
        };
        write_signature(&target, &sig, &opts).unwrap();
        write_delta(&sig, &source, &delta, &opts).unwrap();
        assert!(delta_info(&delta).unwrap().flags.contains(SyncFlags::IN_PLACE));
        let stats = apply_delta_file(&target, &delta, None).unwrap();
        assert!(stats.in_place);
        assert_eq!(fs::read(&target).unwrap(), new);
    }

    #[test]
    fn in_place_requires_in_place_delta() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("old.bin");
        let source = dir.path().join("new.bin");
        fs::write(&target, b"old contents").unwrap();
        fs::write(&source, b"new contents").unwrap();
        let sig = dir.path().join("old.sig");
        let delta = dir.path().join("new.delta");
        let opts = SyncOptions::default();
        write_signature(&target, &sig, &opts).unwrap();
        write_delta(&sig, &source, &delta, &opts).unwrap();
        assert!(apply_delta_file(&target, &delta, None).is_err());
        assert_eq!(fs::read(&target).unwrap(), b"old contents");
    }

    #[test]
    fn missing_target_signature_sends_whole_source() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("absent.bin");
        let source = dir.path().join("new.bin");
        fs::write(&source, b"HELLO").unwrap();
        let sig = dir.path().join("absent.sig");
        let delta = dir.path().join("new.delta");
        let out = dir.path().join("out.bin");
        let opts = SyncOptions::default();

        let s = write_signature(&target, &sig, &opts).unwrap();
        assert!(!s.target_exists);
        let d = write_delta(&sig, &source, &delta, &opts).unwrap();
        assert_eq!(d.matched.lookups, 0);
        assert_eq!(d.matched.diff_bytes, 5);
        apply_delta_file(&target, &delta, Some(&out)).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"HELLO");
    }

    #[test]
    fn sync_file_modes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("old.bin");
        let source = dir.path().join("new.bin");
        let out = dir.path().join("out.bin");
        let old = corpus(50_000, 3);
        let new = edited(&old);
        fs::write(&target, &old).unwrap();
        fs::write(&source, &new).unwrap();

        let multi = SyncOptions {
            multiround: true,
            ..Default::default()
        };
        let stats = sync_file(&target, &source, Some(&out), &multi).unwrap();
        assert!(stats.rounds >= 1);
        assert_eq!(fs::read(&out).unwrap(), new);

        sync_file(&target, &source, None, &SyncOptions::default()).unwrap();
        assert_eq!(fs::read(&target).unwrap(), new);
    }

    #[cfg(feature = "file-io")]
    #[test]
    fn sha256_checksums_computed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("old.bin");
        let source = dir.path().join("new.bin");
        let out = dir.path().join("out.bin");
        fs::write(&target, corpus(4_000, 4)).unwrap();
        fs::write(&source, corpus(4_000, 5)).unwrap();
        let stats = sync_file(&target, &source, Some(&out), &SyncOptions::default()).unwrap();
        let expected: [u8; 32] = sha2::Sha256::digest(fs::read(&source).unwrap()).into();
        assert_eq!(stats.patch.output_sha256, Some(expected));
    }

    #[test]
    fn batch_failures_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let good_src = dir.path().join("good.bin");
        fs::write(&good_src, b"fresh bytes").unwrap();
        let jobs = vec![
            SyncJob {
                target: dir.path().join("good.old"),
                source: good_src,
                output: Some(dir.path().join("good.out")),
            },
            SyncJob {
                target: dir.path().join("bad.old"),
                source: dir.path().join("missing.bin"),
                output: Some(dir.path().join("bad.out")),
            },
        ];
        let results = sync_many(&jobs, &SyncOptions::default());
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert_eq!(fs::read(dir.path().join("good.out")).unwrap(), b"fresh bytes");
    }
}

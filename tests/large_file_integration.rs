use blocksync::engine::{self, SyncOptions};
use blocksync::io::{apply_delta_file, sync_file, write_delta, write_signature};
use std::io::{Read, Seek, SeekFrom, Write};
use tempfile::{NamedTempFile, tempdir};

const GIB: u64 = 1024 * 1024 * 1024;

fn poke(file: &mut NamedTempFile, offset: u64, data: &[u8]) {
    let f = file.as_file_mut();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(data).unwrap();
}

fn same_at(a: &std::path::Path, b: &std::path::Path, offsets: &[u64]) {
    let mut fa = std::fs::File::open(a).unwrap();
    let mut fb = std::fs::File::open(b).unwrap();
    for &off in offsets {
        let mut ba = [0u8; 32];
        let mut bb = [0u8; 32];
        fa.seek(SeekFrom::Start(off)).unwrap();
        fb.seek(SeekFrom::Start(off)).unwrap();
        fa.read_exact(&mut ba).unwrap();
        fb.read_exact(&mut bb).unwrap();
        assert_eq!(ba, bb, "mismatch at offset {off}");
    }
}

#[test]
#[ignore = "multi-GB test is opt-in due runtime and disk requirements"]
fn multi_gb_sparse_file_sync() {
    let mut target = NamedTempFile::new().unwrap();
    let mut source = NamedTempFile::new().unwrap();
    target.as_file_mut().set_len(2 * GIB).unwrap();
    source.as_file_mut().set_len(2 * GIB).unwrap();

    poke(&mut target, 64 * 1024, b"baseline-block");
    poke(&mut source, 64 * 1024, b"mutated-block!");
    poke(&mut source, GIB, b"middle-chunk");

    let dir = tempdir().unwrap();
    let output = dir.path().join("out.bin");
    let opts = SyncOptions {
        multiround: true,
        ..Default::default()
    };
    let stats = sync_file(target.path(), source.path(), Some(&output), &opts).unwrap();
    assert!(stats.rounds > 1);
    assert!(stats.matched.diff_bytes < 16 * 1024 * 1024);

    assert_eq!(
        std::fs::metadata(&output).unwrap().len(),
        std::fs::metadata(source.path()).unwrap().len()
    );
    let checks = [0u64, 64 * 1024, GIB, 2 * GIB - 32];
    same_at(&output, source.path(), &checks);
}

#[test]
#[ignore = "multi-GB test is opt-in due runtime and disk requirements"]
fn multi_gb_sparse_file_signature_delta_patch() {
    let mut target = NamedTempFile::new().unwrap();
    let mut source = NamedTempFile::new().unwrap();
    target.as_file_mut().set_len(GIB).unwrap();
    source.as_file_mut().set_len(GIB + 4096).unwrap();
    poke(&mut source, GIB / 2, b"changed in the middle");

    let dir = tempdir().unwrap();
    let sig = dir.path().join("t.sig");
    let delta = dir.path().join("s.delta");
    let output = dir.path().join("out.bin");
    let opts = SyncOptions::default();

    write_signature(target.path(), &sig, &opts).unwrap();
    let d = write_delta(&sig, source.path(), &delta, &opts).unwrap();
    assert!(d.delta_size < 64 * 1024 * 1024, "delta is {} bytes", d.delta_size);

    let p = apply_delta_file(target.path(), &delta, Some(&output)).unwrap();
    assert_eq!(p.applied.total_size, GIB + 4096);
    same_at(&output, source.path(), &[0, GIB / 2, GIB + 4096 - 32]);
}

#[test]
fn edge_case_matrix() {
    let cases: Vec<(&[u8], &[u8])> = vec![
        (b"", b""),
        (b"", b"x"),
        (b"x", b""),
        (b"\0\0\0\0\0", b"\0\0\0\0\0"),
        (b"\0\0\0\0\0", b"\0\0\0\0\x01"),
    ];

    for (target, source) in cases {
        for multiround in [false, true] {
            let opts = SyncOptions {
                multiround,
                block_len: Some(2),
                ..Default::default()
            };
            let script = engine::diff(target, source, &opts).unwrap();
            assert_eq!(engine::patch(target, &script).unwrap(), source);
        }
        let opts = SyncOptions {
            in_place: true,
            block_len: Some(2),
            ..Default::default()
        };
        let script = engine::diff(target, source, &opts).unwrap();
        let mut buf = target.to_vec();
        engine::patch_in_place(&mut buf, &script).unwrap();
        assert_eq!(buf, source);
    }
}

use blocksync::engine::{self, SyncOptions};
use blocksync::hash::rolling::RollingHasher;
use blocksync::hash::strong::StrongHash;
use blocksync::hash::table::{HashIndex, TargetPosition};
use blocksync::inplace;
use blocksync::multiround::Multiround;
use blocksync::script::{DeltaRecord, DiffRecord, EditScript, EqualRecord};
use blocksync::source::MemorySource;

fn fixed(block_len: u32) -> SyncOptions {
    SyncOptions {
        block_len: Some(block_len),
        ..Default::default()
    }
}

fn equal(index: u64, block_len: u32, source_offset: u64) -> DeltaRecord {
    DeltaRecord::Equal(EqualRecord {
        position: TargetPosition::new(0, index),
        block_len,
        source_offset,
    })
}

#[test]
fn changed_tail_block_is_sent_verbatim() {
    let target = b"AAAABBBBCCCC";
    let source = b"AAAABBBBDDDD";
    let script = engine::diff(target, source, &fixed(4)).unwrap();

    assert_eq!(
        script.records,
        vec![
            equal(0, 4, 0),
            equal(1, 4, 4),
            DeltaRecord::Diff(DiffRecord::bytes(8, b"DDDD".to_vec())),
        ]
    );
    assert_eq!(script.total_size, 12);
    assert_eq!(engine::patch(target, &script).unwrap(), source);
}

#[test]
fn missing_target_sends_everything_without_lookups() {
    let opts = SyncOptions::default();
    let index = engine::build_index(&mut MemorySource::absent("obj"), &opts).unwrap();
    assert!(index.is_empty());

    let mut script = EditScript::new();
    let mut source = MemorySource::new("obj", b"HELLO".to_vec());
    let stats = engine::generate_delta(&mut source, &index, &mut script, &opts).unwrap();

    assert_eq!(stats.lookups, 0);
    assert_eq!(
        script.records,
        vec![DeltaRecord::Diff(DiffRecord::bytes(0, b"HELLO".to_vec()))]
    );
    assert_eq!(engine::patch(b"", &script).unwrap(), b"HELLO");
}

#[test]
fn missing_target_multiround_sends_everything() {
    let mut target = MemorySource::absent("obj");
    let mut source = MemorySource::new("obj", b"HELLO".to_vec());
    let mut script = EditScript::new();
    let report = Multiround::default()
        .run(&mut target, &mut source, &mut script)
        .unwrap();

    assert!(!report.target_exists);
    assert_eq!(report.lookups(), 0);
    assert_eq!(script.diffs().count(), 1);
    assert_eq!(script.equals().count(), 0);
}

#[test]
fn identical_objects_short_circuit() {
    let data: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 253) as u8).collect();
    let mut target = MemorySource::new("obj", data.clone());
    let mut source = MemorySource::new("obj", data.clone());
    let mut script = EditScript::new();
    let report = Multiround::default()
        .run(&mut target, &mut source, &mut script)
        .unwrap();

    assert!(report.identical);
    assert_eq!(report.blocks_hashed(), 0);
    assert!(script.is_empty());
    assert!(script.complete);
    assert_eq!(engine::patch(&data, &script).unwrap(), data);
}

#[test]
fn in_place_swap_demotes_one_block() {
    // Target "AAAABBBB", source "BBBBAAAA": each block reads the other's range.
    let a = EqualRecord {
        position: TargetPosition::new(0, 1),
        block_len: 4,
        source_offset: 0,
    };
    let b = EqualRecord {
        position: TargetPosition::new(0, 0),
        block_len: 4,
        source_offset: 4,
    };
    let plan = inplace::resolve_equals(&[a, b]).unwrap();
    assert_eq!(plan.equals, vec![b]);
    assert_eq!(plan.demoted, vec![a]);

    let target = b"AAAABBBB".to_vec();
    let source = b"BBBBAAAA".to_vec();
    let script = engine::diff(
        &target,
        &source,
        &SyncOptions {
            in_place: true,
            ..fixed(4)
        },
    )
    .unwrap();
    assert_eq!(script.equals().count(), 1);
    assert_eq!(script.diffs().map(|d| d.len()).sum::<u64>(), 4);

    let mut buf = target;
    engine::patch_in_place(&mut buf, &script).unwrap();
    assert_eq!(buf, source);
}

// ---------------------------------------------------------------------------
// Crafted weak-hash collisions
// ---------------------------------------------------------------------------

/// Swapping the bytes of two symmetric pairs keeps both rollsum halves.
fn colliding_pair(len: usize, seed: u8) -> (Vec<u8>, Vec<u8>) {
    let mut a: Vec<u8> = (0..len)
        .map(|i| seed.wrapping_add((i as u8).wrapping_mul(3)))
        .collect();
    let mut b = a.clone();
    // Positions 0,1,2,3 weighted n,n-1,n-2,n-3: +1,-1,-1,+1 sums to zero.
    a[0] = a[0].wrapping_add(1);
    a[3] = a[3].wrapping_add(1);
    b[1] = b[1].wrapping_add(1);
    b[2] = b[2].wrapping_add(1);
    (a, b)
}

#[test]
fn crafted_collisions_share_a_weak_hash() {
    for (len, seed) in [(4, b'a'), (16, 0), (400, 17), (1024, 200)] {
        let (a, b) = colliding_pair(len, seed);
        assert_ne!(a, b);
        assert_eq!(RollingHasher::checksum(&a), RollingHasher::checksum(&b));
        assert_ne!(StrongHash::of(&a), StrongHash::of(&b));
    }
}

#[test]
fn index_never_confirms_a_weak_collision() {
    for (len, seed) in [(4, b'a'), (64, 9), (400, 17)] {
        let (a, b) = colliding_pair(len, seed);
        let weak = RollingHasher::checksum(&a);
        let mut index = HashIndex::new(len as u32);
        index.insert(weak, StrongHash::of(&a), TargetPosition::new(0, 0));

        assert_eq!(index.find(weak, &a), Some(TargetPosition::new(0, 0)));
        assert_eq!(index.find(weak, &b), None);
    }
}

#[test]
fn colliding_source_block_is_not_matched() {
    let (a, b) = colliding_pair(64, 40);
    let script = engine::diff(&a, &b, &fixed(64)).unwrap();
    assert_eq!(script.equals().count(), 0);
    assert_eq!(engine::patch(&a, &script).unwrap(), b);
}

#[test]
fn both_colliding_blocks_in_one_index() {
    let (a, b) = colliding_pair(32, 5);
    let target = [a.clone(), b.clone()].concat();
    let source = [b.clone(), a.clone(), b.clone()].concat();
    let script = engine::diff(&target, &source, &fixed(32)).unwrap();

    assert_eq!(
        script.records,
        vec![equal(1, 32, 0), equal(0, 32, 32), equal(1, 32, 64)]
    );
    assert_eq!(engine::patch(&target, &script).unwrap(), source);
}

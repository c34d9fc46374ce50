#![no_main]
use blocksync::hash::table::TargetPosition;
use blocksync::inplace;
use blocksync::script::EqualRecord;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let block_len = u32::from(data[0] % 16) + 1;
    let blk = block_len as u64;

    // Each pair of bytes is one record: target block index and source offset.
    let records: Vec<EqualRecord> = data[1..]
        .chunks_exact(2)
        .map(|c| EqualRecord {
            position: TargetPosition::new(0, u64::from(c[0] % 64)),
            block_len,
            source_offset: u64::from(c[1]),
        })
        .collect();

    let plan = inplace::resolve_equals(&records).unwrap();
    assert_eq!(plan.equals.len() + plan.demoted.len(), records.len());

    for (i, later) in plan.equals.iter().enumerate() {
        let read = later.target_offset();
        for earlier in &plan.equals[..i] {
            let write = earlier.source_offset;
            assert!(
                write + blk <= read || read + blk <= write,
                "{earlier:?} overwrites the input of {later:?}"
            );
        }
    }
});

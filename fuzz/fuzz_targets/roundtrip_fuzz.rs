#![no_main]
use blocksync::engine::{self, SyncOptions};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    // First byte: mode bits and block length.
    let flags = data[0];
    let payload = &data[1..];
    let split = payload.len() / 2;
    let (target, source) = payload.split_at(split);

    let opts = SyncOptions {
        multiround: flags & 1 != 0,
        in_place: flags & 1 == 0 && flags & 2 != 0,
        block_len: Some(u32::from(flags >> 2).max(1)),
        ..Default::default()
    };

    let script = engine::diff(target, source, &opts).unwrap();
    if opts.in_place {
        let mut buf = target.to_vec();
        engine::patch_in_place(&mut buf, &script).unwrap();
        assert_eq!(buf, source);
    } else {
        assert_eq!(engine::patch(target, &script).unwrap(), source);
    }
});

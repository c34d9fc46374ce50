#![no_main]
use blocksync::hash::table::HashIndex;
use blocksync::script::EditScript;
use blocksync::wire::FrameReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Raw frame decoding must never panic.
    let mut reader = FrameReader::new(data);
    while let Ok(Some(_)) = reader.read_frame() {}

    // Nor may replaying arbitrary frames into any sink.
    let _ = FrameReader::new(data).replay_hashes(&mut HashIndex::default());

    let mut script = EditScript::new();
    let _ = FrameReader::new(data).replay_delta(&mut script);
});

// Recorded edit scripts.
//
// An `EditScript` is the materialized form of one delta stream: equal and
// diff records in emission order, plus the round markers of a multi-round
// pass. It is itself a `DeltaSink`, so any pass can record into it, and it
// can be replayed into another sink.

use crate::error::{Result, SyncError};
use crate::hash::table::TargetPosition;
use crate::source::ByteSource;
use crate::stream::DeltaSink;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Bytes at `source_offset` equal the target block at `position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EqualRecord {
    pub position: TargetPosition,
    pub block_len: u32,
    pub source_offset: u64,
}

impl EqualRecord {
    /// Absolute target offset the block is read from.
    pub fn target_offset(&self) -> u64 {
        self.position.absolute(self.block_len)
    }

    /// True when the block is already where it belongs.
    pub fn is_unmoved(&self) -> bool {
        self.target_offset() == self.source_offset
    }
}

/// Payload of a diff record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffPayload {
    Bytes(Vec<u8>),
    /// `len` bytes still to be read from the source object.
    Deferred { len: u64 },
}

impl DiffPayload {
    pub fn len(&self) -> u64 {
        match self {
            Self::Bytes(b) => b.len() as u64,
            Self::Deferred { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Verbatim bytes destined for `source_offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRecord {
    pub source_offset: u64,
    pub payload: DiffPayload,
}

impl DiffRecord {
    pub fn bytes(source_offset: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            source_offset,
            payload: DiffPayload::Bytes(data.into()),
        }
    }

    pub fn deferred(source_offset: u64, len: u64) -> Self {
        Self {
            source_offset,
            payload: DiffPayload::Deferred { len },
        }
    }

    pub fn len(&self) -> u64 {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Read a deferred payload from `source`.
    pub fn materialize<R: ByteSource + ?Sized>(&mut self, source: &mut R) -> Result<()> {
        if let DiffPayload::Deferred { len } = self.payload {
            let mut buf = vec![0u8; len as usize];
            source.read_exact_at(self.source_offset, &mut buf)?;
            self.payload = DiffPayload::Bytes(buf);
        }
        Ok(())
    }
}

/// One entry of an edit script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaRecord {
    Equal(EqualRecord),
    Diff(DiffRecord),
    NextRound { block_len: u32 },
    EndRound,
}

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

/// A complete delta stream for one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditScript {
    pub name: String,
    /// Block length announced at `begin`.
    pub block_len: u32,
    pub records: Vec<DeltaRecord>,
    /// Size of the reconstructed object, set at `end`.
    pub total_size: u64,
    /// Set once `end` has been recorded.
    pub complete: bool,
}

impl EditScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(&self) -> impl Iterator<Item = &EqualRecord> {
        self.records.iter().filter_map(|r| match r {
            DeltaRecord::Equal(e) => Some(e),
            _ => None,
        })
    }

    pub fn diffs(&self) -> impl Iterator<Item = &DiffRecord> {
        self.records.iter().filter_map(|r| match r {
            DeltaRecord::Diff(d) => Some(d),
            _ => None,
        })
    }

    /// Equal and diff records only.
    pub fn is_empty(&self) -> bool {
        self.equals().next().is_none() && self.diffs().next().is_none()
    }

    pub fn stats(&self) -> ScriptStats {
        let mut stats = ScriptStats::default();
        for r in &self.records {
            match r {
                DeltaRecord::Equal(e) => {
                    stats.equal_records += 1;
                    stats.equal_bytes += e.block_len as u64;
                }
                DeltaRecord::Diff(d) => {
                    stats.diff_records += 1;
                    stats.diff_bytes += d.len();
                }
                DeltaRecord::NextRound { .. } => stats.rounds += 1,
                DeltaRecord::EndRound => {}
            }
        }
        stats
    }

    /// Fill every deferred diff from `source`.
    pub fn materialize<R: ByteSource + ?Sized>(&mut self, source: &mut R) -> Result<()> {
        for r in &mut self.records {
            if let DeltaRecord::Diff(d) = r {
                d.materialize(source)?;
            }
        }
        Ok(())
    }

    /// Replay the script into `sink`. Deferred diffs must be materialized.
    pub fn replay<S: DeltaSink + ?Sized>(&self, sink: &mut S) -> Result<()> {
        sink.begin(&self.name, self.block_len)?;
        for r in &self.records {
            match r {
                DeltaRecord::Equal(e) => sink.equal(e.position, e.block_len, e.source_offset)?,
                DeltaRecord::Diff(d) => match &d.payload {
                    DiffPayload::Bytes(b) => sink.diff(b, d.source_offset)?,
                    DiffPayload::Deferred { .. } => {
                        return Err(SyncError::protocol(format!(
                            "diff at {} replayed before its bytes were read",
                            d.source_offset
                        )));
                    }
                },
                DeltaRecord::NextRound { block_len } => sink.next_round(*block_len)?,
                DeltaRecord::EndRound => sink.end_round()?,
            }
        }
        sink.end(self.total_size)
    }
}

/// Record and byte counts of a script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptStats {
    pub equal_records: u64,
    pub equal_bytes: u64,
    pub diff_records: u64,
    pub diff_bytes: u64,
    /// Rounds after the first.
    pub rounds: u64,
}

impl DeltaSink for EditScript {
    fn begin(&mut self, name: &str, block_len: u32) -> Result<()> {
        self.name = name.to_string();
        self.block_len = block_len;
        self.records.clear();
        self.total_size = 0;
        self.complete = false;
        Ok(())
    }

    fn equal(
        &mut self,
        position: TargetPosition,
        block_len: u32,
        source_offset: u64,
    ) -> Result<()> {
        self.records.push(DeltaRecord::Equal(EqualRecord {
            position,
            block_len,
            source_offset,
        }));
        Ok(())
    }

    fn diff(&mut self, data: &[u8], source_offset: u64) -> Result<()> {
        self.records
            .push(DeltaRecord::Diff(DiffRecord::bytes(source_offset, data)));
        Ok(())
    }

    fn next_round(&mut self, block_len: u32) -> Result<()> {
        self.records.push(DeltaRecord::NextRound { block_len });
        Ok(())
    }

    fn end_round(&mut self) -> Result<()> {
        self.records.push(DeltaRecord::EndRound);
        Ok(())
    }

    fn end(&mut self, total_size: u64) -> Result<()> {
        self.total_size = total_size;
        self.complete = true;
        Ok(())
    }

    fn on_error(&mut self, err: &SyncError) {
        log::debug!("edit script for {}: {err}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn sample() -> EditScript {
        let mut s = EditScript::new();
        s.begin("obj", 4).unwrap();
        s.equal(TargetPosition::new(0, 1), 4, 0).unwrap();
        s.diff(b"xyz", 4).unwrap();
        s.end(7).unwrap();
        s
    }

    #[test]
    fn records_in_order() {
        let s = sample();
        assert!(s.complete);
        assert_eq!(s.total_size, 7);
        assert_eq!(s.records.len(), 2);
        let stats = s.stats();
        assert_eq!(stats.equal_records, 1);
        assert_eq!(stats.equal_bytes, 4);
        assert_eq!(stats.diff_bytes, 3);
    }

    #[test]
    fn replay_reproduces_script() {
        let s = sample();
        let mut copy = EditScript::new();
        s.replay(&mut copy).unwrap();
        assert_eq!(copy, s);
    }

    #[test]
    fn deferred_diff_must_be_materialized() {
        let mut s = EditScript::new();
        s.begin("obj", 4).unwrap();
        s.records.push(DeltaRecord::Diff(DiffRecord::deferred(2, 3)));
        s.end(5).unwrap();
        assert!(s.replay(&mut EditScript::new()).is_err());

        let mut src = MemorySource::new("src", b"abcde".to_vec());
        s.materialize(&mut src).unwrap();
        assert_eq!(
            s.diffs().next().map(|d| d.payload.clone()),
            Some(DiffPayload::Bytes(b"cde".to_vec()))
        );
        assert!(s.replay(&mut EditScript::new()).is_ok());
    }

    #[test]
    fn unmoved_detection() {
        let e = EqualRecord {
            position: TargetPosition::new(0, 2),
            block_len: 4,
            source_offset: 8,
        };
        assert!(e.is_unmoved());
        assert_eq!(e.target_offset(), 8);
    }
}

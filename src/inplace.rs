// In-place dependency resolution.
//
// When the object being rewritten is also the object blocks are read from,
// an equal record that writes `[source_offset, source_offset + blk)` clobbers
// the target blocks `source_offset / blk` and `(source_offset + blk - 1) / blk`.
// Every record reading those blocks must therefore be applied first.
//
// Records form a graph over that relation. A depth-first walk emits nodes in
// post-order (dependencies first). A node reached again while still on the
// walk's stack closes a cycle: that node is demoted to a verbatim diff read
// from the source, and the node that reached it stays an equal record. The
// left neighbour is always walked before the right one, which fixes which
// half of a swap is demoted.
//
// Applying the equal records in plan order, then all diffs, never reads a
// byte after it has been overwritten.

use std::collections::BTreeMap;

use crate::error::{Result, SyncError};
use crate::hash::table::TargetPosition;
use crate::script::{DeltaRecord, DiffPayload, DiffRecord, EditScript, EqualRecord};
use crate::source::ByteSource;
use crate::stream::DeltaSink;

// ---------------------------------------------------------------------------
// Node arena
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Unvisited,
    Stacked,
    Visited,
}

#[derive(Debug, Clone)]
struct EqualNode {
    record: EqualRecord,
    state: NodeState,
    deleted: bool,
}

struct Frame {
    slot: usize,
    edges: Vec<usize>,
    next: usize,
}

/// Equal records in safe application order plus the ones demoted to diffs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InPlacePlan {
    pub block_len: u32,
    /// Apply strictly in this order.
    pub equals: Vec<EqualRecord>,
    /// Records sacrificed to break cycles; their bytes come from the source.
    pub demoted: Vec<EqualRecord>,
}

impl InPlacePlan {
    /// Equal records that actually move bytes.
    pub fn moved(&self) -> impl Iterator<Item = &EqualRecord> {
        self.equals.iter().filter(|e| !e.is_unmoved())
    }

    /// Demoted records as deferred diffs.
    pub fn demoted_diffs(&self) -> impl Iterator<Item = DiffRecord> + '_ {
        self.demoted
            .iter()
            .map(|e| DiffRecord::deferred(e.source_offset, e.block_len as u64))
    }
}

/// Order `records` for in-place application.
///
/// All records must share one block length and read from an unscoped
/// target (`base_offset == 0`).
pub fn resolve_equals(records: &[EqualRecord]) -> Result<InPlacePlan> {
    let Some(first) = records.first() else {
        return Ok(InPlacePlan::default());
    };
    let blk = first.block_len;
    if blk == 0 {
        return Err(SyncError::protocol("in-place records with zero block length"));
    }

    let mut nodes = Vec::with_capacity(records.len());
    let mut by_index: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for (slot, r) in records.iter().enumerate() {
        if r.block_len != blk {
            return Err(SyncError::protocol(format!(
                "in-place records mix block lengths {blk} and {}",
                r.block_len
            )));
        }
        if r.position.base_offset != 0 {
            return Err(SyncError::protocol(format!(
                "in-place record at {} reads from a scoped target range",
                r.source_offset
            )));
        }
        nodes.push(EqualNode {
            record: *r,
            state: NodeState::Unvisited,
            deleted: false,
        });
        by_index.entry(r.position.block_index).or_default().push(slot);
    }

    let edges_of = |slot: usize, rec: &EqualRecord| -> Vec<usize> {
        let b = blk as u64;
        let left = rec.source_offset / b;
        let right = (rec.source_offset + b - 1) / b;
        let mut edges = Vec::new();
        let touched = [Some(left), (right != left).then_some(right)];
        for idx in touched.into_iter().flatten() {
            if let Some(slots) = by_index.get(&idx) {
                edges.extend(slots.iter().copied().filter(|&s| s != slot));
            }
        }
        edges
    };

    let mut plan = InPlacePlan {
        block_len: blk,
        equals: Vec::with_capacity(records.len()),
        demoted: Vec::new(),
    };
    let mut stack: Vec<Frame> = Vec::new();

    for root in 0..nodes.len() {
        if nodes[root].state != NodeState::Unvisited {
            continue;
        }
        nodes[root].state = NodeState::Stacked;
        stack.push(Frame {
            slot: root,
            edges: edges_of(root, &nodes[root].record),
            next: 0,
        });

        while let Some(frame) = stack.last_mut() {
            if frame.next < frame.edges.len() {
                let nb = frame.edges[frame.next];
                frame.next += 1;
                match nodes[nb].state {
                    NodeState::Stacked => {
                        // Back edge: sacrifice the node being revisited.
                        if !nodes[nb].deleted {
                            nodes[nb].deleted = true;
                            plan.demoted.push(nodes[nb].record);
                        }
                    }
                    NodeState::Visited => {}
                    NodeState::Unvisited => {
                        nodes[nb].state = NodeState::Stacked;
                        let edges = edges_of(nb, &nodes[nb].record);
                        stack.push(Frame {
                            slot: nb,
                            edges,
                            next: 0,
                        });
                    }
                }
            } else {
                let slot = frame.slot;
                stack.pop();
                if !nodes[slot].deleted {
                    plan.equals.push(nodes[slot].record);
                }
                nodes[slot].state = NodeState::Visited;
            }
        }
    }

    if !plan.demoted.is_empty() {
        log::debug!(
            "in-place: {} of {} blocks demoted to diffs to break cycles",
            plan.demoted.len(),
            records.len()
        );
    }
    Ok(plan)
}

/// Reorder a single-round script for in-place application.
///
/// Equal records come first in dependency order, followed by demoted
/// records as deferred diffs and then the script's own diffs. Round
/// markers are dropped.
pub fn resolve_in_place(script: &EditScript) -> Result<EditScript> {
    let equals: Vec<EqualRecord> = script.equals().copied().collect();
    let plan = resolve_equals(&equals)?;

    let mut out = EditScript {
        name: script.name.clone(),
        block_len: script.block_len,
        records: Vec::with_capacity(script.records.len()),
        total_size: script.total_size,
        complete: script.complete,
    };
    out.records
        .extend(plan.equals.iter().copied().map(DeltaRecord::Equal));
    out.records.extend(plan.demoted_diffs().map(DeltaRecord::Diff));
    out.records
        .extend(script.diffs().cloned().map(DeltaRecord::Diff));
    Ok(out)
}

// ---------------------------------------------------------------------------
// Stream adapter
// ---------------------------------------------------------------------------

/// Buffers a delta stream and re-emits it in in-place order.
///
/// Diff bytes are not kept: they are re-read from the source in
/// [`finish`](Self::finish), after the matcher has released it.
#[derive(Debug)]
pub struct InPlaceStream<S> {
    inner: S,
    script: EditScript,
    chunk: usize,
}

impl<S: DeltaSink> InPlaceStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            script: EditScript::new(),
            chunk: 1 << 20,
        }
    }

    /// Largest diff record forwarded by `finish`.
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    /// Resolve and forward the buffered stream, skipping equal records that
    /// are already in place. Returns the inner sink.
    pub fn finish<R: ByteSource + ?Sized>(self, source: &mut R) -> Result<S> {
        let mut inner = self.inner;
        let result = forward(&self.script, self.chunk, source, &mut inner);
        if let Err(e) = &result {
            inner.on_error(e);
        }
        result.map(|()| inner)
    }
}

fn forward<R, S>(script: &EditScript, chunk: usize, source: &mut R, sink: &mut S) -> Result<()>
where
    R: ByteSource + ?Sized,
    S: DeltaSink + ?Sized,
{
    if !script.complete {
        return Err(SyncError::protocol("in-place stream finished before end"));
    }
    let equals: Vec<EqualRecord> = script.equals().copied().collect();
    let plan = resolve_equals(&equals)?;
    sink.begin(&script.name, script.block_len)?;
    let mut moved = 0usize;
    for e in plan.moved() {
        sink.equal(e.position, e.block_len, e.source_offset)?;
        moved += 1;
    }
    let mut buf = Vec::new();
    for d in plan.demoted_diffs().chain(script.diffs().cloned()) {
        let mut offset = d.source_offset;
        let end = offset + d.len();
        while offset < end {
            let n = ((end - offset) as usize).min(chunk);
            buf.resize(n, 0);
            source.read_exact_at(offset, &mut buf)?;
            sink.diff(&buf, offset)?;
            offset += n as u64;
        }
    }
    log::debug!("in-place: {} blocks already in place", plan.equals.len() - moved);
    sink.end(script.total_size)
}

impl<S: DeltaSink> DeltaSink for InPlaceStream<S> {
    fn begin(&mut self, name: &str, block_len: u32) -> Result<()> {
        self.script.begin(name, block_len)
    }

    fn equal(
        &mut self,
        position: TargetPosition,
        block_len: u32,
        source_offset: u64,
    ) -> Result<()> {
        self.script.equal(position, block_len, source_offset)
    }

    fn diff(&mut self, data: &[u8], source_offset: u64) -> Result<()> {
        self.script.records.push(DeltaRecord::Diff(DiffRecord {
            source_offset,
            payload: DiffPayload::Deferred {
                len: data.len() as u64,
            },
        }));
        Ok(())
    }

    fn next_round(&mut self, block_len: u32) -> Result<()> {
        self.script.next_round(block_len)
    }

    fn end_round(&mut self) -> Result<()> {
        self.script.end_round()
    }

    fn end(&mut self, total_size: u64) -> Result<()> {
        self.script.end(total_size)
    }

    fn on_error(&mut self, err: &SyncError) {
        self.inner.on_error(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn rec(block_index: u64, source_offset: u64) -> EqualRecord {
        EqualRecord {
            position: TargetPosition::new(0, block_index),
            block_len: 4,
            source_offset,
        }
    }

    #[test]
    fn swap_demotes_back_edge_node() {
        // Target "AAAABBBB", source "BBBBAAAA".
        let a = rec(1, 0); // reads block 1, writes block 0
        let b = rec(0, 4); // reads block 0, writes block 1
        let plan = resolve_equals(&[a, b]).unwrap();
        assert_eq!(plan.equals, vec![b]);
        assert_eq!(plan.demoted, vec![a]);
    }

    #[test]
    fn chain_is_ordered_dependencies_first() {
        // Shift right by one block: block i moves to i + 1.
        let recs: Vec<_> = (0..4).map(|i| rec(i, (i + 1) * 4)).collect();
        let plan = resolve_equals(&recs).unwrap();
        assert!(plan.demoted.is_empty());
        let order: Vec<u64> = plan.equals.iter().map(|e| e.position.block_index).collect();
        assert_eq!(order, vec![3, 2, 1, 0]);
    }

    #[test]
    fn unaligned_writes_depend_on_both_neighbours() {
        // Writes [2, 6): clobbers blocks 0 and 1.
        let mover = rec(2, 2);
        let left_reader = rec(0, 12);
        let right_reader = rec(1, 16);
        let plan = resolve_equals(&[mover, left_reader, right_reader]).unwrap();
        assert!(plan.demoted.is_empty());
        let pos = |r: &EqualRecord| plan.equals.iter().position(|e| e == r).unwrap();
        assert!(pos(&left_reader) < pos(&mover));
        assert!(pos(&right_reader) < pos(&mover));
    }

    #[test]
    fn every_node_is_classified_once() {
        let recs = vec![rec(1, 0), rec(2, 4), rec(0, 8), rec(3, 12), rec(3, 16)];
        let plan = resolve_equals(&recs).unwrap();
        assert_eq!(plan.equals.len() + plan.demoted.len(), recs.len());
        for r in &recs {
            let n = plan.equals.iter().filter(|e| *e == r).count()
                + plan.demoted.iter().filter(|e| *e == r).count();
            assert_eq!(n, 1, "{r:?}");
        }
    }

    #[test]
    fn moved_skips_records_already_in_place() {
        let stay = rec(0, 0);
        let shift = rec(2, 4);
        let plan = resolve_equals(&[stay, shift]).unwrap();
        assert_eq!(plan.equals.len(), 2);
        let moved: Vec<_> = plan.moved().copied().collect();
        assert_eq!(moved, vec![shift]);
    }

    #[test]
    fn mixed_block_lengths_are_rejected() {
        let mut other = rec(0, 8);
        other.block_len = 8;
        assert!(resolve_equals(&[rec(1, 0), other]).is_err());
        let mut scoped = rec(0, 8);
        scoped.position.base_offset = 100;
        assert!(resolve_equals(&[scoped]).is_err());
    }

    #[test]
    fn stream_adapter_forwards_in_place_order() {
        let source = b"BBBBAAAA".to_vec();
        let mut stream = InPlaceStream::new(EditScript::new());
        stream.begin("obj", 4).unwrap();
        stream.equal(TargetPosition::new(0, 1), 4, 0).unwrap();
        stream.equal(TargetPosition::new(0, 0), 4, 4).unwrap();
        stream.end(8).unwrap();

        let mut src = MemorySource::new("obj", source);
        let out = stream.finish(&mut src).unwrap();
        assert_eq!(
            out.records,
            vec![
                DeltaRecord::Equal(rec(0, 4)),
                DeltaRecord::Diff(DiffRecord::bytes(0, b"BBBB".to_vec())),
            ]
        );
    }

    #[test]
    fn stream_adapter_skips_unmoved_blocks() {
        let mut stream = InPlaceStream::new(EditScript::new());
        stream.begin("obj", 4).unwrap();
        stream.equal(TargetPosition::new(0, 0), 4, 0).unwrap();
        stream.diff(b"zz", 4).unwrap();
        stream.end(6).unwrap();
        let mut src = MemorySource::new("obj", b"AAAAzz".to_vec());
        let out = stream.finish(&mut src).unwrap();
        assert_eq!(
            out.records,
            vec![DeltaRecord::Diff(DiffRecord::bytes(4, b"zz".to_vec()))]
        );
        assert_eq!(out.total_size, 6);
    }
}

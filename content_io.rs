//! Block-addressed reads and writes over one snapshot's bytes.
//!
//! A snapshot of `size` bytes is stored as [`BLOCK_SIZE`] blocks keyed by
//! index. Any index without a stored block, and any byte past the end of a
//! stored block but before `size`, reads as zero. Rewriting a block purges
//! the old row and inserts a new one; block rows never build up history.

use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::block_codec::{BlockAddress, BlockCodec, BlockError, BLOCK_SIZE};
use crate::error::{Result, StrongboxError};
use crate::keys::SymmetricKey;
use crate::model::{ContentId, FileDataBlock, FileId, SnapshotId};
use crate::storage::Storage;
use crate::store::{DeletedFilter, Query, ResourceId, Stored, Transaction};

const BLOCK: u64 = BLOCK_SIZE as u64;

/// Where a snapshot's blocks live and the key that opens them.
#[derive(Debug, Clone, Copy)]
pub struct BlockScope<'a> {
    pub file_id: FileId,
    pub content_id: ContentId,
    pub snapshot_id: SnapshotId,
    pub key: &'a SymmetricKey,
}

impl BlockScope<'_> {
    fn address(&self, index: u64) -> BlockAddress {
        BlockAddress {
            file_id: self.file_id,
            content_id: self.content_id,
            index,
        }
    }
}

fn block_fault(index: u64, err: BlockError) -> StrongboxError {
    StrongboxError::internal(format!("block {}: {}", index, err))
}

#[derive(Clone)]
pub struct ContentIo {
    storage: Storage,
    codec: BlockCodec,
}

impl ContentIo {
    pub fn new(storage: Storage, codec: BlockCodec) -> Self {
        Self { storage, codec }
    }

    fn blocks_in(
        &self,
        tx: Option<&Transaction>,
        snapshot_id: SnapshotId,
        first: u64,
        last: u64,
    ) -> BTreeMap<u64, Stored<FileDataBlock>> {
        self.storage
            .blocks
            .query(
                tx,
                &Query::new()
                    .partition(snapshot_id)
                    .filter(move |b: &FileDataBlock| b.index >= first && b.index <= last),
            )
            .into_iter()
            .map(|block| (block.index, block))
            .collect()
    }

    fn open_block(&self, scope: &BlockScope<'_>, block: Option<&Stored<FileDataBlock>>) -> Result<Vec<u8>> {
        match block {
            Some(block) => self
                .codec
                .open(scope.key, &scope.address(block.index), &block.encrypted_bytes)
                .map_err(|e| block_fault(block.index, e)),
            None => Ok(Vec::new()),
        }
    }

    fn replace_block(
        &self,
        tx: &Transaction,
        scope: &BlockScope<'_>,
        index: u64,
        existing: Option<ResourceId>,
        plaintext: &[u8],
    ) -> Result<()> {
        let sealed = self
            .codec
            .seal(scope.key, &scope.address(index), plaintext)
            .map_err(|e| block_fault(index, e))?;
        if let Some(existing) = existing {
            self.storage.blocks.purge(tx, existing)?;
        }
        self.storage.blocks.insert(
            tx,
            FileDataBlock {
                file_id: scope.file_id,
                content_id: scope.content_id,
                snapshot_id: scope.snapshot_id,
                index,
                encrypted_bytes: sealed,
            },
        )?;
        trace!(snapshot = scope.snapshot_id, index, bytes = plaintext.len(), "block written");
        Ok(())
    }

    /// Drop cached analysis results for a snapshot whose bytes changed.
    fn forget_analysis(&self, tx: &Transaction, snapshot_id: SnapshotId) -> Result<()> {
        let rows = self
            .storage
            .analysis
            .query(Some(tx), &Query::new().partition(snapshot_id));
        for row in &rows {
            self.storage.analysis.purge(tx, row.id)?;
        }
        if !rows.is_empty() {
            trace!(snapshot = snapshot_id, rows = rows.len(), "analysis invalidated");
        }
        Ok(())
    }

    pub fn size(&self, tx: Option<&Transaction>, snapshot_id: SnapshotId) -> Result<u64> {
        Ok(self.storage.snapshots.get(tx, snapshot_id)?.size)
    }

    /// Up to `count` bytes starting at `offset`; short only at end of data.
    pub fn read_at(
        &self,
        tx: Option<&Transaction>,
        scope: &BlockScope<'_>,
        offset: u64,
        count: usize,
    ) -> Result<Vec<u8>> {
        let size = self.size(tx, scope.snapshot_id)?;
        if offset >= size || count == 0 {
            return Ok(Vec::new());
        }
        let end = size.min(offset.saturating_add(count as u64));
        let first = offset / BLOCK;
        let last = (end - 1) / BLOCK;
        let blocks = self.blocks_in(tx, scope.snapshot_id, first, last);

        let mut out = Vec::with_capacity(((end - offset) as usize).min(BLOCK_SIZE));
        for index in first..=last {
            let block_start = index * BLOCK;
            let from = (offset.max(block_start) - block_start) as usize;
            let to = (end.min(block_start + BLOCK) - block_start) as usize;
            let plaintext = self.open_block(scope, blocks.get(&index))?;

            let stored_to = to.min(plaintext.len());
            if from < stored_to {
                out.extend_from_slice(&plaintext[from..stored_to]);
            }
            out.resize(out.len() + (to - from.max(stored_to)), 0);
        }
        Ok(out)
    }

    /// Write `data` at `offset`, zero-extending any gap. Returns the new size.
    pub fn write_at(
        &self,
        tx: &Transaction,
        scope: &BlockScope<'_>,
        offset: u64,
        data: &[u8],
    ) -> Result<u64> {
        let size = self.size(Some(tx), scope.snapshot_id)?;
        if data.is_empty() {
            return Ok(size);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| StrongboxError::invalid("write past the addressable range"))?;
        let first = offset / BLOCK;
        let last = (end - 1) / BLOCK;
        let blocks = self.blocks_in(Some(tx), scope.snapshot_id, first, last);

        for index in first..=last {
            let block_start = index * BLOCK;
            let from = (offset.max(block_start) - block_start) as usize;
            let to = (end.min(block_start + BLOCK) - block_start) as usize;
            let existing = blocks.get(&index);

            let mut plaintext = self.open_block(scope, existing)?;
            if plaintext.len() < to {
                plaintext.resize(to, 0);
            }
            let source = (block_start + from as u64 - offset) as usize;
            plaintext[from..to].copy_from_slice(&data[source..source + (to - from)]);
            self.replace_block(tx, scope, index, existing.map(|b| b.id), &plaintext)?;
        }

        self.forget_analysis(tx, scope.snapshot_id)?;
        let new_size = size.max(end);
        if new_size != size {
            self.storage
                .snapshots
                .update(tx, scope.snapshot_id, None, |s| s.size = new_size)?;
        }
        debug!(snapshot = scope.snapshot_id, offset, bytes = data.len(), size = new_size, "content written");
        Ok(new_size)
    }

    /// Set the size to `length`, dropping or trimming blocks past it.
    pub fn truncate(&self, tx: &Transaction, scope: &BlockScope<'_>, length: u64) -> Result<u64> {
        let size = self.size(Some(tx), scope.snapshot_id)?;
        if length == size {
            return Ok(size);
        }
        if length < size {
            let boundary = length / BLOCK;
            let keep_in_boundary = (length % BLOCK) as usize;
            let blocks = self.blocks_in(Some(tx), scope.snapshot_id, boundary, u64::MAX);
            for (index, block) in &blocks {
                if *index > boundary || keep_in_boundary == 0 {
                    self.storage.blocks.purge(tx, block.id)?;
                    continue;
                }
                let mut plaintext = self.open_block(scope, Some(block))?;
                if plaintext.len() > keep_in_boundary {
                    plaintext.truncate(keep_in_boundary);
                    self.replace_block(tx, scope, *index, Some(block.id), &plaintext)?;
                }
            }
        }
        self.forget_analysis(tx, scope.snapshot_id)?;
        self.storage
            .snapshots
            .update(tx, scope.snapshot_id, None, |s| s.size = length)?;
        debug!(snapshot = scope.snapshot_id, from = size, to = length, "content truncated");
        Ok(length)
    }

    /// Copy every block of `from` into `to` verbatim. Block AAD does not
    /// bind the snapshot, so the ciphertext stays valid.
    pub fn copy_blocks(&self, tx: &Transaction, from: SnapshotId, to: SnapshotId) -> Result<usize> {
        let blocks = self.storage.blocks.query(Some(tx), &Query::new().partition(from));
        for block in &blocks {
            self.storage.blocks.insert(
                tx,
                FileDataBlock {
                    snapshot_id: to,
                    ..block.fields.clone()
                },
            )?;
        }
        Ok(blocks.len())
    }

    pub fn purge_blocks(&self, tx: &Transaction, snapshot_id: SnapshotId) -> Result<usize> {
        let blocks = self.storage.blocks.query(
            Some(tx),
            &Query::new()
                .partition(snapshot_id)
                .deleted(DeletedFilter::Include),
        );
        for block in &blocks {
            self.storage.blocks.purge(tx, block.id)?;
        }
        Ok(blocks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime::Lifetime;
    use crate::model::{ContentAnalysis, FileSnapshot};

    async fn setup() -> (Storage, ContentIo, SnapshotId) {
        let storage = Storage::in_memory();
        let io = ContentIo::new(storage.clone(), BlockCodec::default());
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        let snapshot = storage
            .snapshots
            .insert(
                &tx,
                FileSnapshot {
                    file_id: 1,
                    content_id: 2,
                    base_snapshot_id: None,
                    creator_user_id: 1,
                    size: 0,
                },
            )
            .expect("snapshot");
        tx.commit();
        (storage, io, snapshot.id)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[tokio::test]
    async fn write_then_read_for_small_exact_and_multi_block_sizes() {
        let key = SymmetricKey::generate();
        for len in [1000, BLOCK_SIZE, BLOCK_SIZE * 2 + 17] {
            let (storage, io, snapshot_id) = setup().await;
            let scope = BlockScope {
                file_id: 1,
                content_id: 2,
                snapshot_id,
                key: &key,
            };
            let data = pattern(len);
            let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
            assert_eq!(io.write_at(&tx, &scope, 0, &data).expect("write"), len as u64);
            tx.commit();

            let read = io.read_at(None, &scope, 0, len).expect("read");
            assert_eq!(read, data, "length {}", len);
        }
    }

    #[tokio::test]
    async fn gaps_read_as_zero_and_reads_stop_at_size() {
        let key = SymmetricKey::generate();
        let (storage, io, snapshot_id) = setup().await;
        let scope = BlockScope {
            file_id: 1,
            content_id: 2,
            snapshot_id,
            key: &key,
        };
        let offset = BLOCK + 10;
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        io.write_at(&tx, &scope, 0, b"head").expect("write head");
        io.write_at(&tx, &scope, offset, b"tail").expect("write tail");

        let all = io.read_at(Some(&tx), &scope, 0, usize::MAX).expect("read");
        assert_eq!(all.len() as u64, offset + 4);
        assert_eq!(&all[..4], b"head");
        assert!(all[4..offset as usize].iter().all(|b| *b == 0));
        assert_eq!(&all[offset as usize..], b"tail");
        assert!(io.read_at(Some(&tx), &scope, offset + 4, 10).expect("eof").is_empty());
    }

    #[tokio::test]
    async fn overwrite_inside_a_block_keeps_neighbours() {
        let key = SymmetricKey::generate();
        let (storage, io, snapshot_id) = setup().await;
        let scope = BlockScope {
            file_id: 1,
            content_id: 2,
            snapshot_id,
            key: &key,
        };
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        io.write_at(&tx, &scope, 0, b"abcdefgh").expect("write");
        io.write_at(&tx, &scope, 2, b"XY").expect("overwrite");
        assert_eq!(io.read_at(Some(&tx), &scope, 0, 8).expect("read"), b"abXYefgh");
        assert_eq!(
            storage.blocks.count(Some(&tx), &Query::new().partition(snapshot_id)),
            1
        );
    }

    #[tokio::test]
    async fn truncate_shrinks_then_regrows_with_zeros() {
        let key = SymmetricKey::generate();
        let (storage, io, snapshot_id) = setup().await;
        let scope = BlockScope {
            file_id: 1,
            content_id: 2,
            snapshot_id,
            key: &key,
        };
        let data = pattern(BLOCK_SIZE + 100);
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        io.write_at(&tx, &scope, 0, &data).expect("write");

        io.truncate(&tx, &scope, 10).expect("shrink");
        assert_eq!(io.size(Some(&tx), snapshot_id).expect("size"), 10);
        assert_eq!(
            storage.blocks.count(Some(&tx), &Query::new().partition(snapshot_id)),
            1
        );

        io.truncate(&tx, &scope, 20).expect("grow");
        let read = io.read_at(Some(&tx), &scope, 0, 100).expect("read");
        assert_eq!(&read[..10], &data[..10]);
        assert_eq!(&read[10..], &[0u8; 10]);
    }

    #[tokio::test]
    async fn copied_blocks_open_under_the_new_snapshot() {
        let key = SymmetricKey::generate();
        let (storage, io, snapshot_id) = setup().await;
        let scope = BlockScope {
            file_id: 1,
            content_id: 2,
            snapshot_id,
            key: &key,
        };
        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        io.write_at(&tx, &scope, 0, b"forked bytes").expect("write");
        let fork = storage
            .snapshots
            .insert(
                &tx,
                FileSnapshot {
                    file_id: 1,
                    content_id: 2,
                    base_snapshot_id: Some(snapshot_id),
                    creator_user_id: 1,
                    size: 12,
                },
            )
            .expect("fork");
        assert_eq!(io.copy_blocks(&tx, snapshot_id, fork.id).expect("copy"), 1);

        let fork_scope = BlockScope {
            snapshot_id: fork.id,
            ..scope
        };
        assert_eq!(io.read_at(Some(&tx), &fork_scope, 0, 64).expect("read"), b"forked bytes");
        assert_eq!(io.purge_blocks(&tx, fork.id).expect("purge"), 1);
        assert_eq!(io.read_at(Some(&tx), &scope, 0, 64).expect("base intact"), b"forked bytes");
    }

    #[tokio::test]
    async fn rewriting_a_snapshot_drops_its_cached_analysis() {
        let key = SymmetricKey::generate();
        let (storage, io, snapshot_id) = setup().await;
        let scope = BlockScope {
            file_id: 1,
            content_id: 2,
            snapshot_id,
            key: &key,
        };
        let cache = |tx: &Transaction| {
            storage
                .analysis
                .insert(
                    tx,
                    ContentAnalysis {
                        file_id: 1,
                        content_id: 2,
                        snapshot_id,
                        threats: Some(Vec::new()),
                        mime: Some("text/plain".to_string()),
                    },
                )
                .expect("cache row");
        };
        let cached = |tx: &Transaction| storage.analysis.count(Some(tx), &Query::new().partition(snapshot_id));

        let tx = storage.db.begin(&Lifetime::new()).await.expect("begin");
        io.write_at(&tx, &scope, 0, b"hello ").expect("write");
        cache(&tx);
        io.write_at(&tx, &scope, 6, b"world").expect("append");
        assert_eq!(cached(&tx), 0);

        cache(&tx);
        io.truncate(&tx, &scope, 5).expect("truncate");
        assert_eq!(cached(&tx), 0);
    }
}

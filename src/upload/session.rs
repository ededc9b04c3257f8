//! Upload session state
//!
//! Tracks the server-issued upload id, the chunk layout and the set of
//! acknowledged chunk indices. The set only ever grows.

use parking_lot::Mutex;
use std::collections::BTreeSet;

use super::chunk::ChunkPlan;
use super::TransferProgress;

/// One in-progress large-file transfer
#[derive(Debug)]
pub struct UploadSession {
    upload_id: String,
    plan: ChunkPlan,
    acknowledged: Mutex<BTreeSet<u64>>,
}

impl UploadSession {
    /// Start tracking a session issued by the server
    pub fn new(upload_id: impl Into<String>, plan: ChunkPlan) -> Self {
        Self {
            upload_id: upload_id.into(),
            plan,
            acknowledged: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    pub fn total_chunks(&self) -> u64 {
        self.plan.total_chunks()
    }

    pub fn chunk_size(&self) -> u64 {
        self.plan.chunk_size()
    }

    /// Record a server acknowledgment and return the resulting progress.
    ///
    /// Indices outside the plan are ignored; acknowledging twice is a no-op.
    pub fn mark_uploaded(&self, chunk_index: u64) -> TransferProgress {
        let mut acknowledged = self.acknowledged.lock();
        if chunk_index < self.plan.total_chunks() {
            acknowledged.insert(chunk_index);
        }
        TransferProgress::new(
            acknowledged.len() as u64,
            self.plan.total_chunks(),
            Some(chunk_index),
        )
    }

    /// Current progress
    pub fn progress(&self) -> TransferProgress {
        let acknowledged = self.acknowledged.lock();
        TransferProgress::new(acknowledged.len() as u64, self.plan.total_chunks(), None)
    }

    pub fn is_acknowledged(&self, chunk_index: u64) -> bool {
        self.acknowledged.lock().contains(&chunk_index)
    }

    /// True once every chunk has been acknowledged
    pub fn is_complete(&self) -> bool {
        self.acknowledged.lock().len() as u64 >= self.plan.total_chunks()
    }

    /// Indices not yet acknowledged, in order
    pub fn pending_chunks(&self) -> Vec<u64> {
        let acknowledged = self.acknowledged.lock();
        (0..self.plan.total_chunks())
            .filter(|index| !acknowledged.contains(index))
            .collect()
    }
}

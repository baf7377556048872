//! 📬 WorkQueue: a bounded multi-consumer queue with a ledger of unfinished work.
//!
//! `put` / `get` / `task_done` / `join`, like every work queue since the dawn of threads,
//! plus one extra verb: `depart`. A worker whose backend dies calls it on the way out.
//!
//! Why the extra verb: each worker gets exactly one [`WorkItem::EndOfStream`] at the end.
//! A departed worker never picks its sentinel up, so "every item acknowledged" would never
//! happen and `join` would wait forever. The ledger remembers how many workers left, and
//! `join` accepts exactly that many unacknowledged items as stranded sentinels.
//!
//! Once every worker has departed the queue closes, and a blocked `put` fails instead of
//! waiting for a consumer that will never come.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_channel::{Receiver, Sender, TryRecvError};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::common::Partition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkItem {
    Partition(Partition),
    /// 🏁 One per worker. The worker that takes it goes home.
    EndOfStream,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ledger {
    /// Items put but not yet acknowledged.
    unfinished: u64,
    /// Workers that left after losing their backend.
    departed: u64,
    /// Workers the queue was built for.
    members: u64,
}

impl Ledger {
    // -- unconsumed sentinels >= departed at all times once feeding is done,
    // -- so equality means no partition is left unacknowledged
    fn settled(&self) -> bool {
        self.unfinished <= self.departed || self.deserted()
    }

    fn deserted(&self) -> bool {
        self.departed >= self.members
    }
}

/// 🏁 How `join` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinOutcome {
    /// Every partition was acknowledged by somebody.
    Complete,
    /// Every worker departed; whatever is still queued will never be processed.
    Abandoned,
}

#[derive(Debug, Clone)]
pub(crate) struct WorkQueue {
    tx: Sender<WorkItem>,
    rx: Receiver<WorkItem>,
    ledger: Arc<watch::Sender<Ledger>>,
}

impl WorkQueue {
    /// 🏗️ Capacity equals the worker count: at most one queued item per live consumer.
    pub(crate) fn new(members: usize) -> Self {
        let (tx, rx) = async_channel::bounded(members.max(1));
        let (ledger, _) = watch::channel(Ledger {
            members: members as u64,
            ..Ledger::default()
        });
        Self {
            tx,
            rx,
            ledger: Arc::new(ledger),
        }
    }

    /// 📥 Blocks while the queue is full. Fails once every worker has departed.
    pub(crate) async fn put(&self, item: WorkItem) -> Result<()> {
        self.ledger.send_modify(|ledger| ledger.unfinished += 1);
        if self.tx.send(item).await.is_err() {
            self.ledger
                .send_modify(|ledger| ledger.unfinished = ledger.unfinished.saturating_sub(1));
            bail!("💀 Work queue is closed: every worker has left the building.");
        }
        trace!("📥 queued {:?}", item);
        Ok(())
    }

    /// 📤 `None` once the queue is closed and empty.
    pub(crate) async fn get(&self) -> Option<WorkItem> {
        self.rx.recv().await.ok()
    }

    /// ✅ Acknowledge one item taken with `get`.
    pub(crate) fn task_done(&self) {
        self.ledger
            .send_modify(|ledger| ledger.unfinished = ledger.unfinished.saturating_sub(1));
    }

    /// 🪦 Leave for good. Call `task_done` for the item in hand first.
    pub(crate) fn depart(&self) {
        let mut deserted = false;
        self.ledger.send_modify(|ledger| {
            ledger.departed += 1;
            deserted = ledger.deserted();
        });
        if deserted {
            debug!("🪦 last worker departed, closing the work queue");
            self.tx.close();
        }
    }

    /// ⏳ Wait until the queued work is settled. Call after the last `put`.
    pub(crate) async fn join(&self) -> JoinOutcome {
        let mut ledger = self.ledger.subscribe();
        let settled = match ledger.wait_for(Ledger::settled).await {
            Ok(settled) => *settled,
            // -- we hold the sender, so this cannot happen; treat it as the worst case
            Err(_) => return JoinOutcome::Abandoned,
        };
        if settled.deserted() {
            JoinOutcome::Abandoned
        } else {
            JoinOutcome::Complete
        }
    }

    /// 🧺 Pull out every partition nobody will ever take. Sentinels are dropped.
    pub(crate) fn drain_stranded(&self) -> Vec<Partition> {
        let mut stranded = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(WorkItem::Partition(partition)) => stranded.push(partition),
                Ok(WorkItem::EndOfStream) => {}
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        stranded
    }
}

//! Parallel submission of independent, fully signed transactions.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use derive_builder::Builder;
use flume::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::message::Transaction;
use crate::rpc::ClusterRpc;
use crate::submit::OnlineSubmitter;
use crate::types::{lamports_to_sol, Pubkey, Signature};

#[derive(Builder, Debug, Clone)]
#[builder(pattern = "owned")]
pub struct BatchConfig {
    #[builder(default = "4")]
    pub threads: usize,
    #[builder(default)]
    pub dry_run: bool,
    #[builder(default = "Arc::new(AtomicU64::new(0))")]
    pub progress: Arc<AtomicU64>,
}

impl BatchConfig {
    fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::InvalidConfig("threads must be >= 1".into()));
        }
        Ok(())
    }
}

impl BatchConfigBuilder {
    fn validate(&self) -> Result<()> {
        if self.threads == Some(0) {
            return Err(Error::InvalidConfig("threads must be >= 1".into()));
        }
        Ok(())
    }

    pub fn build_validated(self) -> Result<BatchConfig> {
        self.validate()?;
        self.build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub transaction: Transaction,
    pub memo: String,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub memo: String,
    pub result: Result<Signature>,
}

/// Hands out job indices to workers.
#[derive(Debug)]
struct JobCursor {
    next: AtomicUsize,
}

impl JobCursor {
    const fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn fetch(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

type JobResult = (usize, Result<Signature>);

/// Submits `items` on a pool of `config.threads` workers.
///
/// Before anything is sent, the summed fees of each fee payer are checked against its
/// balance; a shortfall fails the whole batch with [`Error::InsufficientFunds`]. With
/// `dry_run` set, the batch stops after that check and returns no outcomes.
///
/// Outcomes come back in input order. Items sharing a nonce account race; at most one
/// of them confirms.
pub fn submit_batch<C: ClusterRpc + 'static>(
    rpc: Arc<C>,
    items: Vec<BatchItem>,
    config: &BatchConfig,
) -> Result<Vec<BatchOutcome>> {
    config.validate()?;
    config.progress.store(0, Ordering::SeqCst);
    if items.is_empty() {
        return Ok(Vec::new());
    }

    check_fees(rpc.as_ref(), &items)?;
    if config.dry_run {
        info!(
            "Dry run requested, exiting before sending {} transactions",
            items.len()
        );
        return Ok(Vec::new());
    }

    let (memos, transactions): (Vec<String>, Vec<Transaction>) = items
        .into_iter()
        .map(|item| (item.memo, item.transaction))
        .unzip();
    let total = transactions.len();
    let transactions = Arc::new(transactions);
    let cursor = Arc::new(JobCursor::new());
    let threads = config.threads.min(total);
    let bound = (threads * 2).max(1);
    let (tx, rx): (Sender<JobResult>, Receiver<JobResult>) = flume::bounded(bound);
    let mut joins = Vec::with_capacity(threads);

    for _ in 0..threads {
        let worker_rpc = rpc.clone();
        let worker_jobs = transactions.clone();
        let worker_cursor = cursor.clone();
        let worker_tx = tx.clone();
        let join = thread::spawn(move || {
            worker_loop(worker_rpc.as_ref(), &worker_jobs, &worker_cursor, worker_tx);
        });
        joins.push(join);
    }
    drop(tx);

    let mut results: Vec<Option<Result<Signature>>> = (0..total).map(|_| None).collect();
    while let Ok((index, result)) = rx.recv() {
        let done = config.progress.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Batch progress {}/{}", done, total);
        results[index] = Some(result);
    }
    join_handles(joins);

    let outcomes: Vec<BatchOutcome> = memos
        .into_iter()
        .zip(results)
        .map(|(memo, result)| BatchOutcome {
            memo,
            result: result.unwrap_or_else(|| {
                Err(Error::NetworkError("worker exited before reporting".into()))
            }),
        })
        .collect();
    let confirmed = outcomes.iter().filter(|o| o.result.is_ok()).count();
    info!("Batch finished: {}/{} confirmed", confirmed, total);
    Ok(outcomes)
}

fn worker_loop<C: ClusterRpc + ?Sized>(
    rpc: &C,
    jobs: &[Transaction],
    cursor: &JobCursor,
    tx: Sender<JobResult>,
) {
    let submitter = OnlineSubmitter::new(rpc);
    loop {
        let index = cursor.fetch();
        let Some(transaction) = jobs.get(index) else {
            break;
        };
        let result = submitter.send(transaction);
        if let Err(err) = &result {
            warn!("Batch item {} failed: {}", index, err);
        }
        if tx.send((index, result)).is_err() {
            break;
        }
    }
}

fn join_handles(joins: Vec<thread::JoinHandle<()>>) {
    for handle in joins {
        let _ = handle.join();
    }
}

fn check_fees<C: ClusterRpc + ?Sized>(rpc: &C, items: &[BatchItem]) -> Result<()> {
    let mut fees: BTreeMap<Pubkey, u64> = BTreeMap::new();
    for item in items {
        let message = item.transaction.message();
        let fee = rpc.get_fee_for_message(message)?;
        let total = fees.entry(message.fee_payer()).or_default();
        *total = total.saturating_add(fee);
    }
    for (fee_payer, required) in fees {
        let available = rpc.get_balance(&fee_payer)?;
        info!(
            "Fee payer {} needs {} SOL for the batch, has {} SOL",
            fee_payer,
            lamports_to_sol(required),
            lamports_to_sol(available)
        );
        if available < required {
            return Err(Error::InsufficientFunds {
                account: fee_payer,
                required,
                available,
            });
        }
    }
    Ok(())
}

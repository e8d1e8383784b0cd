use crate::store::{BulkItemResult, BulkMode, BulkOperation, DocumentStore, ShardTarget};
use common::UserId;
use common::config::BulkConfig;
use common::errors::AppError;
use common::util::retry::{Backoff, retry_with_backoff};
use log::{debug, error, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// 单条写入失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemFailure {
    pub doc_id: String,
    pub user_id: UserId,
    pub reason: String,
}

/// 批量写入汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub succeeded: u64,
    pub failed: Vec<BulkItemFailure>,
    /// 实际发送的批次数
    pub batches: u64,
}

impl BulkReport {
    pub fn failed_user_ids(&self) -> Vec<UserId> {
        self.failed.iter().map(|f| f.user_id).collect()
    }
}

enum Command {
    Add(BulkOperation),
    Flush(oneshot::Sender<()>),
}

/// 批次在途计数，flush 时等它归零
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    notify: Notify,
}

impl InFlight {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn end(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// 批量写入器
///
/// `add` 进入有界队列（满了挂起），后台聚合任务按条数 / 字节数 / 空闲时间切批，
/// 再交给固定数量的 worker 并行发送。单条失败和整批失败都只记入报告，不影响其它批次。
pub struct BulkProcessor {
    tx: Option<mpsc::Sender<Command>>,
    accumulator: Option<JoinHandle<()>>,
    in_flight: Arc<InFlight>,
    report: Arc<Mutex<BulkReport>>,
}

impl BulkProcessor {
    /// 启动聚合任务和 worker 池，必须在 tokio 运行时内调用
    pub fn start(store: Arc<dyn DocumentStore>, target: ShardTarget, mode: BulkMode, cfg: &BulkConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Command>(cfg.queue_capacity.max(1));
        let workers = cfg.workers.max(1);
        // 批次队列容量 = worker 数，worker 全忙时聚合任务阻塞，压力回传到 add
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<BulkOperation>>(workers);
        let batch_rx = Arc::new(AsyncMutex::new(batch_rx));
        let in_flight = Arc::new(InFlight::default());
        let report = Arc::new(Mutex::new(BulkReport::default()));
        let backoff = Backoff::new(cfg.backoff_initial_ms, cfg.backoff_max_ms, cfg.max_retries);

        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    store: store.clone(),
                    target: target.clone(),
                    mode,
                    backoff,
                    report: report.clone(),
                    in_flight: in_flight.clone(),
                };
                tokio::spawn(worker.run(batch_rx.clone()))
            })
            .collect();

        let acc = Accumulator {
            max_actions: cfg.bulk_actions.max(1),
            max_bytes: cfg.bulk_size_bytes.max(1),
            interval: Duration::from_millis(cfg.flush_interval_ms.max(1)),
            batch_tx,
            in_flight: in_flight.clone(),
            pending: Vec::new(),
            pending_bytes: 0,
            deadline: None,
        };
        let accumulator = tokio::spawn(acc.run(rx, handles));

        Self { tx: Some(tx), accumulator: Some(accumulator), in_flight, report }
    }

    /// 入队一条写入，队列满时挂起
    pub async fn add(&self, op: BulkOperation) -> Result<(), AppError> {
        let tx = self.tx.as_ref().ok_or_else(|| AppError::Internal("bulk processor closed".to_string()))?;
        tx.send(Command::Add(op)).await.map_err(|_| AppError::Internal("bulk processor stopped".to_string()))
    }

    /// 发出所有待写条目，并等待在途批次全部完成
    pub async fn flush(&self) -> Result<(), AppError> {
        let tx = self.tx.as_ref().ok_or_else(|| AppError::Internal("bulk processor closed".to_string()))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Command::Flush(ack_tx)).await.map_err(|_| AppError::Internal("bulk processor stopped".to_string()))?;
        ack_rx.await.map_err(|_| AppError::Internal("bulk processor dropped flush".to_string()))?;
        self.in_flight.wait_idle().await;
        Ok(())
    }

    /// 当前累计报告
    pub fn report(&self) -> BulkReport {
        self.report.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// flush 后停止 worker，返回最终报告
    pub async fn close(mut self) -> Result<BulkReport, AppError> {
        // 关闭发送端，聚合任务会发出剩余条目并等 worker 退出
        self.tx.take();
        if let Some(handle) = self.accumulator.take() {
            handle.await.map_err(|e| AppError::Internal(format!("bulk accumulator panicked: {}", e)))?;
        }
        Ok(self.report())
    }
}

struct Accumulator {
    max_actions: usize,
    max_bytes: usize,
    interval: Duration,
    batch_tx: mpsc::Sender<Vec<BulkOperation>>,
    in_flight: Arc<InFlight>,
    pending: Vec<BulkOperation>,
    pending_bytes: usize,
    /// 当前批次的最晚发送时间
    deadline: Option<Instant>,
}

impl Accumulator {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, workers: Vec<JoinHandle<()>>) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Add(op)) => self.push(op).await,
                    Some(Command::Flush(ack)) => {
                        self.dispatch().await;
                        let _ = ack.send(());
                    }
                    None => break,
                },
                _ = sleep_until(deadline), if deadline.is_some() => {
                    debug!("bulk idle flush: {} pending", self.pending.len());
                    self.dispatch().await;
                }
            }
        }
        self.dispatch().await;
        drop(self.batch_tx);
        for handle in workers {
            if let Err(e) = handle.await {
                error!("bulk worker panicked: {}", e);
            }
        }
    }

    async fn push(&mut self, op: BulkOperation) {
        if !self.pending.is_empty() && self.pending_bytes + op.size > self.max_bytes {
            self.dispatch().await;
        }
        self.pending_bytes += op.size;
        self.pending.push(op);
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.interval);
        }
        if self.pending.len() >= self.max_actions || self.pending_bytes >= self.max_bytes {
            self.dispatch().await;
        }
    }

    async fn dispatch(&mut self) {
        self.deadline = None;
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        self.in_flight.begin();
        if self.batch_tx.send(batch).await.is_err() {
            // worker 全部退出，只能放弃
            self.in_flight.end();
            error!("bulk workers gone, batch dropped");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

struct Worker {
    id: usize,
    store: Arc<dyn DocumentStore>,
    target: ShardTarget,
    mode: BulkMode,
    backoff: Backoff,
    report: Arc<Mutex<BulkReport>>,
    in_flight: Arc<InFlight>,
}

impl Worker {
    async fn run(self, rx: Arc<AsyncMutex<mpsc::Receiver<Vec<BulkOperation>>>>) {
        loop {
            let batch = {
                let mut guard = rx.lock().await;
                guard.recv().await
            };
            let Some(batch) = batch else { break };
            self.send(batch).await;
            self.in_flight.end();
        }
        debug!("bulk worker {} stopped", self.id);
    }

    async fn send(&self, batch: Vec<BulkOperation>) {
        let what = format!("bulk {} x{} -> {}", self.id, batch.len(), self.target.container);
        let outcome = retry_with_backoff(&self.backoff, &what, || self.store.bulk(&self.target, self.mode, &batch)).await;
        let mut report = match self.report.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        report.batches += 1;
        match outcome {
            Ok(items) => {
                for BulkItemResult { doc_id, user_id, error } in items {
                    match error {
                        None => report.succeeded += 1,
                        Some(reason) => {
                            warn!("⚠️ bulk item {} failed: {}", doc_id, reason);
                            report.failed.push(BulkItemFailure { doc_id, user_id, reason });
                        }
                    }
                }
            }
            Err(e) => {
                error!("❌ {} failed after retries: {}", what, e);
                let reason = e.to_string();
                report.failed.extend(batch.into_iter().map(|op| BulkItemFailure {
                    doc_id: op.doc_id,
                    user_id: op.user_id,
                    reason: reason.clone(),
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fault_store::FaultStore;
    use mongodb::bson::doc;

    fn target() -> ShardTarget {
        ShardTarget { container: "channel_participants_011".into(), channel_id: 11 }
    }

    fn op(uid: i64) -> BulkOperation {
        BulkOperation::new(format!("channel:11:{}", uid), uid, doc! { "channel_id": 11i64, "user_id": uid })
    }

    fn cfg(actions: usize, workers: usize) -> BulkConfig {
        BulkConfig { bulk_actions: actions, workers, backoff_initial_ms: 1, backoff_max_ms: 2, ..Default::default() }
    }

    #[tokio::test]
    async fn count_bound_splits_batches() {
        let store = Arc::new(FaultStore::new());
        let p = BulkProcessor::start(store.clone(), target(), BulkMode::Index, &cfg(10, 3));
        for uid in 1..=25 {
            p.add(op(uid)).await.unwrap();
        }
        let report = p.close().await.unwrap();
        assert_eq!(report.succeeded, 25);
        assert_eq!(report.batches, 3);
        assert!(report.failed.is_empty());
        assert_eq!(store.inner.doc_count(&target()), 25);
    }

    #[tokio::test]
    async fn byte_bound_splits_batches() {
        let store = Arc::new(FaultStore::new());
        let size = op(1).size;
        let c = BulkConfig { bulk_size_bytes: size * 2, ..cfg(1000, 1) };
        let p = BulkProcessor::start(store.clone(), target(), BulkMode::Index, &c);
        for uid in 1..=6 {
            p.add(op(uid)).await.unwrap();
        }
        let report = p.close().await.unwrap();
        assert_eq!(report.succeeded, 6);
        assert_eq!(report.batches, 3);
    }

    #[tokio::test]
    async fn idle_interval_flushes_pending() {
        let store = Arc::new(FaultStore::new());
        let c = BulkConfig { flush_interval_ms: 20, ..cfg(1000, 1) };
        let p = BulkProcessor::start(store.clone(), target(), BulkMode::Index, &c);
        for uid in 1..=3 {
            p.add(op(uid)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.inner.doc_count(&target()), 3);
        assert_eq!(p.report().succeeded, 3);
        p.close().await.unwrap();
    }

    #[tokio::test]
    async fn flush_waits_for_in_flight() {
        let store = Arc::new(FaultStore::new());
        let p = BulkProcessor::start(store.clone(), target(), BulkMode::Upsert, &cfg(4, 2));
        for uid in 1..=9 {
            p.add(op(uid)).await.unwrap();
        }
        p.flush().await.unwrap();
        assert_eq!(p.report().succeeded, 9);
        assert_eq!(store.inner.doc_count(&target()), 9);
        p.close().await.unwrap();
    }

    #[tokio::test]
    async fn item_failures_are_reported_not_fatal() {
        let store = Arc::new(FaultStore::new());
        store.bulk_reject.insert(5);
        let p = BulkProcessor::start(store.clone(), target(), BulkMode::Index, &cfg(4, 2));
        for uid in 1..=10 {
            p.add(op(uid)).await.unwrap();
        }
        let report = p.close().await.unwrap();
        assert_eq!(report.succeeded, 9);
        assert_eq!(report.failed_user_ids(), vec![5]);
        assert_eq!(report.failed[0].doc_id, "channel:11:5");
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let store = Arc::new(FaultStore::new());
        store.bulk_transient.store(2, Ordering::SeqCst);
        let p = BulkProcessor::start(store.clone(), target(), BulkMode::Index, &cfg(100, 1));
        for uid in 1..=5 {
            p.add(op(uid)).await.unwrap();
        }
        let report = p.close().await.unwrap();
        assert_eq!(report.succeeded, 5);
        assert_eq!(store.bulk_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_only_that_batch() {
        let store = Arc::new(FaultStore::new());
        store.bulk_transient.store(2, Ordering::SeqCst);
        let c = BulkConfig { max_retries: 1, ..cfg(5, 1) };
        let p = BulkProcessor::start(store.clone(), target(), BulkMode::Index, &c);
        for uid in 1..=10 {
            p.add(op(uid)).await.unwrap();
        }
        let report = p.close().await.unwrap();
        assert_eq!(report.failed.len(), 5);
        assert_eq!(report.succeeded, 5);
        assert_eq!(report.batches, 2);
    }

    #[tokio::test]
    async fn full_queue_suspends_add_until_store_drains() {
        let store = Arc::new(FaultStore::new());
        let hold = store.bulk_gate.write().await;
        let c = BulkConfig { queue_capacity: 1, ..cfg(1, 1) };
        let p = BulkProcessor::start(store.clone(), target(), BulkMode::Index, &c);

        // worker、批次队列、聚合任务、入口队列各压住一条，之后的 add 挂起
        let mut accepted = 0;
        for uid in 1..=10 {
            match tokio::time::timeout(Duration::from_millis(200), p.add(op(uid))).await {
                Ok(res) => {
                    res.unwrap();
                    accepted += 1;
                }
                Err(_) => break,
            }
        }
        assert!(accepted < 10, "add never blocked");
        assert!(accepted <= 4, "accepted {}", accepted);
        assert_eq!(store.bulk_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.doc_count(&target()), 0);

        drop(hold);
        p.add(op(100)).await.unwrap();
        let report = p.close().await.unwrap();
        assert_eq!(report.succeeded, accepted + 1);
        assert_eq!(store.inner.doc_count(&target()), accepted as usize + 1);
    }

    #[tokio::test]
    async fn close_without_items_reports_nothing() {
        let store = Arc::new(FaultStore::new());
        let p = BulkProcessor::start(store, target(), BulkMode::Index, &cfg(10, 1));
        let report = p.close().await.unwrap();
        assert_eq!(report, BulkReport::default());
    }
}

use crate::error::ScanError;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DEFAULT_WORKERS: usize = 10;

/// 传递给每个任务的工作者上下文。
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub index: usize,
    pub cancel: CancellationToken,
}

/// 有界任务队列 + N 个工作者 + 有界结果队列。
///
/// 关闭顺序：关闭任务队列，等待全部工作者退出，再关闭结果队列。
/// 调用方需在关闭期间并发消费结果，否则结果队列写满后会互相等待。
pub struct WorkerPool<J, R> {
    workers: usize,
    cancel: CancellationToken,
    job_tx: Option<mpsc::Sender<J>>,
    job_rx: Arc<Mutex<mpsc::Receiver<J>>>,
    result_tx: Option<mpsc::Sender<R>>,
    result_rx: Option<mpsc::Receiver<R>>,
    handles: JoinSet<()>,
}

impl<J, R> WorkerPool<J, R>
where
    J: Send + 'static,
    R: Send + 'static,
{
    pub fn new(workers: usize, buffer_size: usize, cancel: CancellationToken) -> Self {
        let workers = if workers == 0 { DEFAULT_WORKERS } else { workers };
        let buffer_size = if buffer_size == 0 { workers * 2 } else { buffer_size };
        let (job_tx, job_rx) = mpsc::channel(buffer_size);
        let (result_tx, result_rx) = mpsc::channel(buffer_size);

        Self {
            workers,
            cancel,
            job_tx: Some(job_tx),
            job_rx: Arc::new(Mutex::new(job_rx)),
            result_tx: Some(result_tx),
            result_rx: Some(result_rx),
            handles: JoinSet::new(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// 启动工作者。任务函数返回 None 时不产生结果。
    pub fn start<F, Fut>(&mut self, worker_fn: F)
    where
        F: Fn(WorkerContext, J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<R>> + Send + 'static,
    {
        let Some(result_tx) = self.result_tx.as_ref() else {
            return;
        };
        let worker_fn = Arc::new(worker_fn);

        for index in 0..self.workers {
            let jobs = Arc::clone(&self.job_rx);
            let results = result_tx.clone();
            let cancel = self.cancel.clone();
            let worker_fn = Arc::clone(&worker_fn);

            self.handles.spawn(async move {
                loop {
                    let job = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        job = async { jobs.lock().await.recv().await } => job,
                    };
                    let Some(job) = job else { break };

                    let ctx = WorkerContext {
                        index,
                        cancel: cancel.clone(),
                    };
                    let Some(result) = worker_fn(ctx, job).await else {
                        continue;
                    };

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        sent = results.send(result) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    }

    pub async fn submit(&self, job: J) -> Result<(), ScanError> {
        let Some(job_tx) = self.job_tx.as_ref() else {
            return Err(ScanError::PoolClosed);
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ScanError::Cancelled),
            sent = job_tx.send(job) => sent.map_err(|_| ScanError::PoolClosed),
        }
    }

    /// 任务队列的附加发送端，供工作者在处理过程中追加任务。
    pub fn job_sender(&self) -> Option<JobSender<J>> {
        self.job_tx.as_ref().map(|tx| JobSender { tx: tx.clone() })
    }

    /// 取走结果接收端，只能取一次。
    pub fn take_results(&mut self) -> Option<mpsc::Receiver<R>> {
        self.result_rx.take()
    }

    pub async fn close(&mut self) {
        self.job_tx.take();
        while let Some(joined) = self.handles.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "工作者异常退出");
            }
        }
        self.result_tx.take();
    }

    /// 启动、投递全部任务、关闭并收集结果。
    pub async fn run<I, F, Fut>(mut self, jobs: I, worker_fn: F) -> Vec<R>
    where
        I: IntoIterator<Item = J>,
        F: Fn(WorkerContext, J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<R>> + Send + 'static,
    {
        let Some(mut results) = self.take_results() else {
            return Vec::new();
        };
        self.start(worker_fn);

        let feed = async {
            for job in jobs {
                if self.submit(job).await.is_err() {
                    break;
                }
            }
            self.close().await;
        };
        let collect = async {
            let mut collected = Vec::new();
            while let Some(result) = results.recv().await {
                collected.push(result);
            }
            collected
        };

        let ((), collected) = tokio::join!(feed, collect);
        collected
    }
}

/// 持有发送端会使任务队列保持打开，持有者需自行通过取消令牌结束运行。
#[derive(Debug)]
pub struct JobSender<J> {
    tx: mpsc::Sender<J>,
}

impl<J> Clone for JobSender<J> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<J> JobSender<J> {
    /// 非阻塞投递，队列已满或已关闭时返回 false。
    pub fn try_submit(&self, job: J) -> bool {
        self.tx.try_send(job).is_ok()
    }
}

/// 计数信号量，许可在 drop 时归还。
#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Arc<tokio::sync::Semaphore>,
}

pub type Permit = tokio::sync::OwnedSemaphorePermit;

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Semaphore::new(permits.max(1))),
        }
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Permit, ScanError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ScanError::Cancelled),
            permit = Arc::clone(&self.inner).acquire_owned() => permit.map_err(|_| ScanError::PoolClosed),
        }
    }

    pub fn try_acquire(&self) -> Option<Permit> {
        Arc::clone(&self.inner).try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }
}

/// 并发映射，输出顺序与输入一致。
///
/// 任一元素失败时返回下标最小的错误；已取消而未执行的元素计为 Cancelled。
pub async fn parallel_map<T, R, F, Fut>(
    cancel: &CancellationToken,
    items: Vec<T>,
    workers: usize,
    f: F,
) -> Result<Vec<R>, ScanError>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, ScanError>>,
{
    parallel_map_settled(cancel, items, workers, f)
        .await
        .into_iter()
        .collect()
}

/// 与 parallel_map 相同，但逐个返回每个元素的结果，失败不影响其他元素。
pub async fn parallel_map_settled<T, R, F, Fut>(
    cancel: &CancellationToken,
    items: Vec<T>,
    workers: usize,
    f: F,
) -> Vec<Result<R, ScanError>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, ScanError>>,
{
    let workers = if workers == 0 { items.len().max(1) } else { workers };
    let semaphore = Semaphore::new(workers);
    let total = items.len();

    let mut pending: FuturesUnordered<_> = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let semaphore = semaphore.clone();
            let f = &f;
            async move {
                let result = match semaphore.acquire(cancel).await {
                    Ok(_permit) => f(item).await,
                    Err(e) => Err(e),
                };
                (index, result)
            }
        })
        .collect();

    let mut slots: Vec<Option<Result<R, ScanError>>> = (0..total).map(|_| None).collect();
    while let Some((index, result)) = pending.next().await {
        slots[index] = Some(result);
    }

    slots
        .into_iter()
        .map(|slot| slot.unwrap_or(Err(ScanError::Cancelled)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_pool_processes_all_jobs() {
        let pool = WorkerPool::new(4, 0, CancellationToken::new());
        assert_eq!(pool.workers(), 4);

        let mut results = pool
            .run(0..100u32, |_ctx, job| async move { Some(job * 2) })
            .await;
        results.sort();

        assert_eq!(results.len(), 100);
        assert_eq!(results[99], 198);
    }

    #[tokio::test]
    async fn test_pool_filters_none_results() {
        let pool = WorkerPool::new(3, 2, CancellationToken::new());
        let results = pool
            .run(0..20u32, |_ctx, job| async move { (job % 2 == 0).then_some(job) })
            .await;
        assert_eq!(results.len(), 10);
    }

    #[tokio::test]
    async fn test_worker_indices_within_bounds() {
        let pool = WorkerPool::new(5, 0, CancellationToken::new());
        let indices: HashSet<usize> = pool
            .run(0..50u32, |ctx, _job| async move { Some(ctx.index) })
            .await
            .into_iter()
            .collect();
        assert!(indices.iter().all(|i| *i < 5));
    }

    #[tokio::test]
    async fn test_pool_default_workers() {
        let pool: WorkerPool<u32, u32> = WorkerPool::new(0, 0, CancellationToken::new());
        assert_eq!(pool.workers(), DEFAULT_WORKERS);
    }

    #[tokio::test]
    async fn test_pool_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let processed = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(2, 2, cancel.clone());

        let counter = Arc::clone(&processed);
        let trigger = cancel.clone();
        let results = pool
            .run(0..1000u32, move |_ctx, job| {
                let counter = Arc::clone(&counter);
                let trigger = trigger.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 10 {
                        trigger.cancel();
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    Some(job)
                }
            })
            .await;

        assert!(processed.load(Ordering::SeqCst) < 1000);
        assert!(results.len() < 1000);
    }

    #[tokio::test]
    async fn test_submit_after_close() {
        let mut pool: WorkerPool<u32, u32> = WorkerPool::new(1, 1, CancellationToken::new());
        pool.close().await;
        assert!(matches!(pool.submit(1).await, Err(ScanError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_semaphore() {
        let sem = Semaphore::new(2);
        let cancel = CancellationToken::new();
        let a = sem.acquire(&cancel).await.unwrap();
        let _b = sem.try_acquire().unwrap();
        assert!(sem.try_acquire().is_none());
        assert_eq!(sem.available(), 0);
        drop(a);
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn test_parallel_map_preserves_order() {
        let cancel = CancellationToken::new();
        let items: Vec<u64> = (0..20).collect();
        let output = parallel_map(&cancel, items, 4, |n| async move {
            tokio::time::sleep(Duration::from_millis(20 - n)).await;
            Ok(n * 10)
        })
        .await
        .unwrap();

        let expected: Vec<u64> = (0..20).map(|n| n * 10).collect();
        assert_eq!(output, expected);
    }

    #[tokio::test]
    async fn test_parallel_map_returns_lowest_index_error() {
        let cancel = CancellationToken::new();
        let err = parallel_map(&cancel, vec![1u32, 2, 3, 4], 0, |n| async move {
            if n >= 2 {
                Err(ScanError::InvalidTarget(n.to_string()))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ScanError::InvalidTarget(ref s) if s == "2"));
    }

    #[tokio::test]
    async fn test_parallel_map_settled_keeps_successes() {
        let cancel = CancellationToken::new();
        let output = parallel_map_settled(&cancel, vec![1u32, 2, 3], 0, |n| async move {
            if n == 2 {
                Err(ScanError::Config("two".to_string()))
            } else {
                Ok(n * 10)
            }
        })
        .await;

        assert_eq!(output.len(), 3);
        assert_eq!(output[0].as_ref().ok(), Some(&10));
        assert!(output[1].is_err());
        assert_eq!(output[2].as_ref().ok(), Some(&30));
    }

    #[tokio::test]
    async fn test_parallel_map_empty() {
        let cancel = CancellationToken::new();
        let output: Vec<u32> = parallel_map(&cancel, Vec::<u32>::new(), 0, |n| async move { Ok(n) })
            .await
            .unwrap();
        assert!(output.is_empty());
    }
}

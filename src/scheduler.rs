//! 按 key (频道 id) 管理的可取消延时任务
//!
//! 同一个 key 只保留最新的一个任务；取消只作用于等待阶段，
//! 任务一旦触发就会执行完毕。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Scheduled {
    id: u64,
    due: Instant,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct TaskScheduler {
    tasks: Arc<Mutex<HashMap<String, Scheduled>>>,
    next_id: AtomicU64,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `delay` 之后执行 `task`，替换同 key 下尚未触发的任务
    pub fn schedule<F>(&self, key: &str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let entry = Scheduled {
            id,
            due: Instant::now() + delay,
            cancel: cancel.clone(),
        };
        if let Some(previous) = self.tasks.lock().insert(key.to_string(), entry) {
            previous.cancel.cancel();
        }

        let tasks = Arc::clone(&self.tasks);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            {
                let mut tasks = tasks.lock();
                if tasks.get(&key).map(|t| t.id) == Some(id) {
                    tasks.remove(&key);
                }
            }
            task.await;
        });
    }

    /// 取消尚未触发的任务，返回是否存在
    pub fn cancel(&self, key: &str) -> bool {
        match self.tasks.lock().remove(key) {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.cancel.cancel();
        }
    }

    /// 距离触发的剩余时间
    pub fn remaining(&self, key: &str) -> Option<Duration> {
        self.tasks
            .lock()
            .get(key)
            .map(|t| t.due.saturating_duration_since(Instant::now()))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let scheduler = TaskScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("cam1", Duration::from_secs(2), counter_task(&fired));

        assert_eq!(scheduler.remaining("cam1"), Some(Duration::from_secs(2)));
        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let scheduler = TaskScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("cam1", Duration::from_secs(1), counter_task(&fired));
        assert!(scheduler.cancel("cam1"));
        assert!(!scheduler.cancel("cam1"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_pending_task() {
        let scheduler = TaskScheduler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("cam1", Duration::from_secs(1), counter_task(&first));
        scheduler.schedule("cam1", Duration::from_secs(3), counter_task(&second));
        scheduler.schedule("cam2", Duration::from_secs(1), counter_task(&second));
        assert_eq!(scheduler.len(), 2);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 2);

        scheduler.schedule("cam1", Duration::from_secs(1), counter_task(&first));
        scheduler.cancel_all();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
    }
}

//! Per-user FIFO request lanes.
//!
//! teloxide processes updates of one chat sequentially, so a handler that
//! awaited a long Claude run would also hold back `/stop` and the Stop button.
//! Handlers push the work onto the user's lane instead and return at once.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::mpsc;

use ctb_core::domain::UserId;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Lane {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
}

impl Lane {
    fn spawn(user_id: UserId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = pending.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                // A panicking job must not take the lane down with it.
                if let Err(e) = tokio::spawn(job).await {
                    tracing::error!(user_id = user_id.0, error = %e, "request task failed");
                }
                counter.fetch_sub(1, Ordering::SeqCst);
            }
        });
        Self { tx, pending }
    }
}

#[derive(Default)]
pub struct UserQueues {
    lanes: Mutex<HashMap<UserId, Lane>>,
}

impl UserQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job` behind the user's earlier requests. Returns how many
    /// requests were already running or waiting.
    pub fn enqueue<F>(&self, user_id: UserId, job: F) -> usize
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let lane = lanes.entry(user_id).or_insert_with(|| Lane::spawn(user_id));
        let ahead = lane.pending.fetch_add(1, Ordering::SeqCst);

        if let Err(mpsc::error::SendError(job)) = lane.tx.send(Box::pin(job)) {
            // The worker is gone (runtime shutting down); start a fresh lane.
            tracing::warn!(user_id = user_id.0, "request lane closed, restarting");
            let fresh = Lane::spawn(user_id);
            fresh.pending.fetch_add(1, Ordering::SeqCst);
            let _ = fresh.tx.send(job);
            *lane = fresh;
            return 0;
        }
        ahead
    }

    /// Requests running or waiting for `user_id`.
    pub fn pending(&self, user_id: UserId) -> usize {
        self.lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&user_id)
            .map(|l| l.pending.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

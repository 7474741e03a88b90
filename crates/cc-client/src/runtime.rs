//! Process-level wiring for the client runtime: a single event loop
//! running cooperatively-scheduled concurrent operations — heartbeats, the
//! retry-queue scanner, and (via [`crate::group::GroupFanout`]) group
//! fan-out — sharing serial access to each community's cache and to the
//! retry queue.
//!
//! [`AgentRuntime`] is the thing a host application actually starts and
//! stops; [`crate::community::CommunityManager`] and
//! [`crate::pipeline::MessagePipeline`] stay independently testable without
//! it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::community::CommunityManager;
use crate::config::Settings;
use crate::group::GroupFanout;
use crate::pipeline::MessagePipeline;
use crate::relay_client::ReqwestTransport;
use crate::retry_queue::RetryQueue;

pub struct AgentRuntime {
    pub community_manager: Arc<CommunityManager<ReqwestTransport>>,
    pub pipeline: Arc<MessagePipeline<ReqwestTransport>>,
    pub group_fanout: Arc<GroupFanout<ReqwestTransport>>,
    retry_queue: Arc<RetryQueue>,
    settings: Settings,
    running: Arc<AtomicBool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl AgentRuntime {
    pub fn new(
        settings: Settings,
        community_manager: Arc<CommunityManager<ReqwestTransport>>,
        pipeline: Arc<MessagePipeline<ReqwestTransport>>,
        group_fanout: Arc<GroupFanout<ReqwestTransport>>,
        retry_queue: Arc<RetryQueue>,
    ) -> Self {
        Self {
            community_manager,
            pipeline,
            group_fanout,
            retry_queue,
            settings,
            running: Arc::new(AtomicBool::new(false)),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Sends an initial heartbeat to every community, then spawns the
    /// heartbeat timer and the 1s retry-queue scanner. Idempotent: a second
    /// call is a no-op while already running.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.community_manager
            .heartbeat_all(&self.settings.endpoint)
            .await;

        let mut tasks = self.tasks.lock().expect("runtime task list mutex poisoned");
        tasks.push(self.spawn_heartbeat_loop());
        tasks.push(self.spawn_retry_scanner());
    }

    fn spawn_heartbeat_loop(&self) -> JoinHandle<()> {
        let manager = self.community_manager.clone();
        let endpoint = self.settings.endpoint.clone();
        let interval = self.settings.heartbeat_interval();
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately; start() already sent one
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                manager.heartbeat_all(&endpoint).await;
            }
        })
    }

    fn spawn_retry_scanner(&self) -> JoinHandle<()> {
        let pipeline = self.pipeline.clone();
        let retry_queue = self.retry_queue.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let now = chrono::Utc::now();
                for expired in retry_queue.expire_stale(now) {
                    info!(message_id = %expired, "retry entry expired past 1h horizon");
                }
                // One in-flight attempt per entry; entries within
                // a batch run concurrently, the scanner waits for the whole
                // batch before its next 1s tick.
                let due = retry_queue.take_due(now);
                let attempts = due.iter().map(|entry| pipeline.attempt_retry(entry));
                futures::future::join_all(attempts).await;
            }
        })
    }

    /// Cancels heartbeat/scanner tasks and flushes contact caches to disk.
    /// In-flight deliveries are allowed to finish or time out on their own;
    /// this only stops scheduling new ones. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("runtime task list mutex poisoned"));
        for handle in handles {
            handle.abort();
        }
        self.community_manager.persist_all_caches().await;
        info!("agent runtime stopped, caches flushed");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for AgentRuntime {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!("AgentRuntime dropped while running; call stop() first to flush caches");
        }
    }
}

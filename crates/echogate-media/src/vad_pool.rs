//! C2 — bounded pool of VAD engine instances.
//!
//! Mirrors the source's `VADModelPool`: a fixed number of model instances
//! handed out via a FIFO queue so a burst of classification calls across
//! sessions can't head-of-line-block on a single shared model.

use tokio::sync::mpsc;

use crate::vad::EnergyVad;

/// Speech-probability threshold above which a frame counts as speech.
pub const SPEECH_THRESHOLD: f64 = 0.6;

/// Default number of pooled VAD instances — enough concurrent sessions to
/// avoid head-of-line blocking without holding many idle model instances.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Bounded pool of [`EnergyVad`] instances.
pub struct VadPool {
    size: usize,
    free_tx: mpsc::Sender<EnergyVad>,
    free_rx: tokio::sync::Mutex<mpsc::Receiver<EnergyVad>>,
    initialized: std::sync::atomic::AtomicBool,
}

impl VadPool {
    /// Construct a pool with `size` slots. Slots are not populated until
    /// [`VadPool::initialize`] runs, matching the source's explicit
    /// `initialize_vad()` startup step (calling `acquire` before that fails
    /// loudly rather than silently blocking forever).
    pub fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::channel(size.max(1));
        Self {
            size,
            free_tx: tx,
            free_rx: tokio::sync::Mutex::new(rx),
            initialized: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Populate the pool with `size` fresh instances. Idempotent.
    pub async fn initialize(&self) {
        use std::sync::atomic::Ordering;
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        for _ in 0..self.size {
            // Channel has exactly `size` capacity, so this never blocks.
            let _ = self.free_tx.send(EnergyVad::new()).await;
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Acquire a free VAD instance, blocking (FIFO, fair) until one is
    /// released. Fails if the pool hasn't been initialized yet.
    pub async fn acquire(&self) -> echogate_core::error::Result<VadGuard<'_>> {
        if !self.is_initialized() {
            return Err(echogate_core::error::GatewayError::Upstream(
                "VAD pool not initialized".to_string(),
            ));
        }
        let mut rx = self.free_rx.lock().await;
        let instance = rx
            .recv()
            .await
            .expect("free_tx is held by VadPool for its lifetime");
        Ok(VadGuard {
            pool: self,
            instance: Some(instance),
        })
    }

    /// Classify a 16 kHz int16 frame as containing speech, acquiring and
    /// releasing a pool slot for the call.
    pub async fn detect(&self, frame: &[u8]) -> echogate_core::error::Result<bool> {
        let guard = self.acquire().await?;
        let probability = guard.instance().speech_probability(frame);
        Ok(probability > SPEECH_THRESHOLD)
    }
}

/// RAII guard releasing its VAD instance back to the pool on drop, so a
/// panicking or early-returning caller never leaks a slot.
pub struct VadGuard<'a> {
    pool: &'a VadPool,
    instance: Option<EnergyVad>,
}

impl VadGuard<'_> {
    pub fn instance(&self) -> &EnergyVad {
        self.instance.as_ref().expect("instance present until drop")
    }
}

impl Drop for VadGuard<'_> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            // Bounded channel with capacity == pool size: exactly one permit
            // per issued instance is ever outstanding, so this cannot fail
            // for "channel full" — only if the pool itself was dropped.
            let _ = self.pool.free_tx.try_send(instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn detect_before_initialize_fails_loudly() {
        let pool = VadPool::new(2);
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test]
    async fn acquire_up_to_pool_size_does_not_block() {
        let pool = Arc::new(VadPool::new(4));
        pool.initialize().await;

        let mut guards = Vec::new();
        for _ in 0..4 {
            let fut = pool.acquire();
            let guard = tokio::time::timeout(Duration::from_millis(50), fut)
                .await
                .expect("acquire within pool size should not block")
                .unwrap();
            guards.push(guard);
        }
    }

    #[tokio::test]
    async fn acquiring_beyond_pool_size_queues_until_release() {
        let pool = Arc::new(VadPool::new(1));
        pool.initialize().await;

        let guard = pool.acquire().await.unwrap();

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move {
            let _second = pool2.acquire().await.unwrap();
        });

        // Still held: the second acquire must not have completed yet.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("second acquire should complete once released")
            .unwrap();
    }

    #[tokio::test]
    async fn detect_releases_slot_for_reuse() {
        let pool = VadPool::new(1);
        pool.initialize().await;
        let samples = vec![0u8; 640];
        for _ in 0..3 {
            let result = pool.detect(&samples).await.unwrap();
            assert!(!result);
        }
    }
}

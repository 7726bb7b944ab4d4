//! Reference-counted radio ownership with debounced teardown
//!
//! Every screen or command that needs the radio takes a reference. The radio
//! is created on the first acquisition and torn down only after the count has
//! stayed at zero for the debounce period, so a release immediately followed
//! by an acquire (a screen transition) keeps the same instance alive.

use crate::error::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type RadioFactory<R> = Arc<dyn Fn() -> BoxFuture<'static, Result<R>> + Send + Sync>;

struct LifecycleState<R> {
    references: usize,
    radio: Option<Arc<R>>,
    teardown: Option<JoinHandle<()>>,
}

pub struct RadioLifecycle<R> {
    state: Arc<Mutex<LifecycleState<R>>>,
    factory: RadioFactory<R>,
    debounce: Duration,
}

impl<R: Send + Sync + 'static> RadioLifecycle<R> {
    pub fn new(factory: RadioFactory<R>, debounce: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(LifecycleState {
                references: 0,
                radio: None,
                teardown: None,
            })),
            factory,
            debounce,
        }
    }

    /// Take a reference, creating the radio if none is alive.
    /// Cancels any pending teardown.
    pub async fn acquire(&self) -> Result<Arc<R>> {
        let mut state = self.state.lock().await;

        if let Some(task) = state.teardown.take() {
            task.abort();
            debug!("Pending radio teardown cancelled");
        }

        let radio = match &state.radio {
            Some(radio) => Arc::clone(radio),
            None => {
                let radio = Arc::new((self.factory)().await?);
                info!("📡 Radio manager created");
                state.radio = Some(Arc::clone(&radio));
                radio
            }
        };

        state.references += 1;
        debug!("Radio reference acquired ({} held)", state.references);
        Ok(radio)
    }

    /// Drop a reference. Teardown is scheduled once the count reaches zero.
    pub async fn release(&self) {
        let mut state = self.state.lock().await;

        if state.references == 0 {
            warn!("Radio reference released more times than acquired");
            return;
        }
        state.references -= 1;
        debug!("Radio reference released ({} held)", state.references);

        if state.references > 0 || state.radio.is_none() {
            return;
        }

        let shared = Arc::clone(&self.state);
        let debounce = self.debounce;
        state.teardown = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let mut state = shared.lock().await;
            state.teardown = None;
            if state.references == 0 && state.radio.take().is_some() {
                info!("📴 Radio manager torn down");
            }
        }));
    }

    /// The live radio, if any
    pub async fn current(&self) -> Option<Arc<R>> {
        self.state.lock().await.radio.clone()
    }

    pub async fn references(&self) -> usize {
        self.state.lock().await.references
    }
}

//! A bounded object pool with validation, idle limits and eviction.
//!
//! [`Pool`] hands out [`Pooled`] guards. Dropping a guard returns the item
//! without blocking; items that cannot be kept idle are destroyed on a
//! background task. At most `max_active` items are out at once unless the
//! exhausted action is [`ExhaustedAction::Grow`].

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ExhaustedAction, PoolConfig};
use crate::transport::TransportError;
use crate::{Error, Result};

/// Creates, checks and destroys pooled items.
#[async_trait]
pub trait PoolFactory: Send + Sync + 'static {
    /// The pooled item.
    type Item: Send + Sync + 'static;

    /// Creates a new item.
    async fn create(&self) -> Result<Self::Item>;

    /// Returns true if the item can be handed out.
    async fn validate(&self, item: &Self::Item) -> bool;

    /// Releases an item's resources.
    async fn destroy(&self, item: Self::Item) -> Result<()>;
}

struct IdleEntry<T> {
    item: T,
    since: Instant,
}

struct PoolInner<F: PoolFactory> {
    name: String,
    config: PoolConfig,
    factory: F,
    permits: Arc<Semaphore>,
    /// Most recently returned first.
    idle: Mutex<VecDeque<IdleEntry<F::Item>>>,
    active: AtomicUsize,
    closed: AtomicBool,
}

impl<F: PoolFactory> PoolInner<F> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleEntry<F::Item>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> Error {
        Error::PoolClosed(self.name.clone())
    }

    async fn destroy(&self, item: F::Item) {
        if let Err(e) = self.factory.destroy(item).await {
            warn!(pool = %self.name, error = %e, "failed to destroy pooled connection");
        }
    }

    fn destroy_in_background(self: &Arc<Self>, item: F::Item) {
        match Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(self);
                handle.spawn(async move { pool.destroy(item).await });
            }
            Err(_) => {
                warn!(pool = %self.name, "no runtime available, dropping connection without cleanup");
            }
        }
    }

    async fn evict(&self, min_idle: Duration) {
        let stale: Vec<F::Item> = {
            let mut idle = self.idle();
            let (stale, keep): (VecDeque<_>, VecDeque<_>) = idle
                .drain(..)
                .partition(|entry| entry.since.elapsed() >= min_idle);
            *idle = keep;
            stale.into_iter().map(|entry| entry.item).collect()
        };
        if !stale.is_empty() {
            debug!(pool = %self.name, count = stale.len(), "evicting idle connections");
        }
        for item in stale {
            self.destroy(item).await;
        }
    }
}

/// An item taken from the pool but not yet handed to a borrower. Dropping
/// it destroys the item, so a cancelled borrow does not leak it.
struct Checkout<F: PoolFactory> {
    item: Option<F::Item>,
    pool: Arc<PoolInner<F>>,
}

impl<F: PoolFactory> Checkout<F> {
    fn new(pool: &Arc<PoolInner<F>>, item: F::Item) -> Self {
        Self {
            item: Some(item),
            pool: Arc::clone(pool),
        }
    }

    fn item(&self) -> &F::Item {
        match &self.item {
            Some(item) => item,
            None => unreachable!("checked out item taken twice"),
        }
    }

    fn into_inner(mut self) -> F::Item {
        match self.item.take() {
            Some(item) => item,
            None => unreachable!("checked out item taken twice"),
        }
    }
}

impl<F: PoolFactory> Drop for Checkout<F> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            debug!(pool = %self.pool.name, "borrow cancelled, destroying connection");
            self.pool.destroy_in_background(item);
        }
    }
}

struct Evictor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// A bounded pool of items produced by a [`PoolFactory`].
pub struct Pool<F: PoolFactory> {
    inner: Arc<PoolInner<F>>,
    evictor: Mutex<Option<Evictor>>,
}

impl<F: PoolFactory> Pool<F> {
    /// Creates a pool. Starts the evictor if eviction is configured and a
    /// Tokio runtime is available.
    pub fn new(name: impl Into<String>, config: PoolConfig, factory: F) -> Self {
        let inner = Arc::new(PoolInner {
            name: name.into(),
            config,
            factory,
            permits: Arc::new(Semaphore::new(config.max_active)),
            idle: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        let evictor = config
            .eviction()
            .and_then(|(interval, min_idle)| spawn_evictor(&inner, interval, min_idle));

        Self {
            inner,
            evictor: Mutex::new(evictor),
        }
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Pool settings.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Items currently borrowed.
    #[must_use]
    pub fn num_active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Items waiting for reuse.
    #[must_use]
    pub fn num_idle(&self) -> usize {
        self.inner.idle().len()
    }

    /// Whether [`Pool::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Borrows an item.
    ///
    /// Idle items are reused most recent first and validated; invalid ones
    /// are destroyed. With no valid idle item a new one is created.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolClosed`] if the pool is closed
    /// - [`Error::PoolExhausted`] if no slot is free under
    ///   [`ExhaustedAction::Fail`], the `max_wait` elapses under
    ///   [`ExhaustedAction::Block`], creation fails, or a new item fails
    ///   validation
    pub async fn borrow(&self) -> Result<Pooled<F>> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(inner.closed_error());
        }
        let permit = self.acquire().await?;
        if inner.is_closed() {
            return Err(inner.closed_error());
        }

        loop {
            let entry = inner.idle().pop_front();
            let Some(entry) = entry else { break };
            let candidate = Checkout::new(inner, entry.item);
            if inner.factory.validate(candidate.item()).await {
                return Ok(self.hand_out(candidate.into_inner(), permit));
            }
            debug!(pool = %inner.name, "discarding invalid idle connection");
            inner.destroy(candidate.into_inner()).await;
        }

        let item = inner.factory.create().await.map_err(|e| {
            Error::exhausted(
                format!("could not create a connection for pool '{}'", inner.name),
                Some(e),
            )
        })?;
        let candidate = Checkout::new(inner, item);
        if inner.factory.validate(candidate.item()).await {
            debug!(pool = %inner.name, "created pooled connection");
            return Ok(self.hand_out(candidate.into_inner(), permit));
        }
        inner.destroy(candidate.into_inner()).await;
        Err(Error::exhausted(
            format!("new connection for pool '{}' failed validation", inner.name),
            Some(Error::connection(
                format!("validate connection for pool '{}'", inner.name),
                TransportError::NotConnected,
            )),
        ))
    }

    async fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>> {
        let inner = &self.inner;
        let permits = Arc::clone(&inner.permits);
        let busy = || {
            Error::exhausted(
                format!(
                    "pool '{}' has {} active connections",
                    inner.name, inner.config.max_active
                ),
                None,
            )
        };

        match inner.config.exhausted_action {
            ExhaustedAction::Fail => match permits.try_acquire_owned() {
                Ok(permit) => Ok(Some(permit)),
                Err(TryAcquireError::NoPermits) => Err(busy()),
                Err(TryAcquireError::Closed) => Err(inner.closed_error()),
            },
            ExhaustedAction::Grow => match permits.try_acquire_owned() {
                Ok(permit) => Ok(Some(permit)),
                Err(TryAcquireError::NoPermits) => {
                    debug!(pool = %inner.name, "growing beyond maxActive");
                    Ok(None)
                }
                Err(TryAcquireError::Closed) => Err(inner.closed_error()),
            },
            ExhaustedAction::Block => {
                let acquire = permits.acquire_owned();
                let acquired = match inner.config.wait_limit() {
                    Some(limit) => tokio::time::timeout(limit, acquire).await.map_err(|_| {
                        Error::exhausted(
                            format!("timed out waiting for a connection from pool '{}'", inner.name),
                            Some(Error::Timeout(limit)),
                        )
                    })?,
                    None => acquire.await,
                };
                acquired.map(Some).map_err(|_| inner.closed_error())
            }
        }
    }

    fn hand_out(&self, item: F::Item, permit: Option<OwnedSemaphorePermit>) -> Pooled<F> {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        Pooled {
            item: Some(item),
            pool: Arc::clone(&self.inner),
            invalid: false,
            _permit: permit,
        }
    }

    /// Closes the pool.
    ///
    /// Stops the evictor, rejects further borrows and destroys every idle
    /// item. Borrowed items are destroyed when returned. Closing twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClose`] with every destroy failure.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.permits.close();

        let evictor = self
            .evictor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(evictor) = evictor {
            let _ = evictor.stop.send(true);
            if let Err(e) = evictor.handle.await {
                warn!(pool = %inner.name, error = %e, "evictor task failed");
            }
        }

        let idle: Vec<F::Item> = inner.idle().drain(..).map(|entry| entry.item).collect();
        let mut failures = Vec::new();
        for item in idle {
            if let Err(e) = inner.factory.destroy(item).await {
                failures.push(e);
            }
        }

        info!(pool = %inner.name, failures = failures.len(), "pool closed");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::PoolClose(failures))
        }
    }
}

impl<F: PoolFactory> Drop for Pool<F> {
    fn drop(&mut self) {
        let evictor = self
            .evictor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(evictor) = evictor {
            evictor.handle.abort();
        }
    }
}

impl<F: PoolFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("active", &self.num_active())
            .field("idle", &self.num_idle())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn spawn_evictor<F: PoolFactory>(
    inner: &Arc<PoolInner<F>>,
    interval: Duration,
    min_idle: Duration,
) -> Option<Evictor> {
    let Ok(runtime) = Handle::try_current() else {
        warn!(pool = %inner.name, "no runtime available, idle eviction disabled");
        return None;
    };

    let pool: Weak<PoolInner<F>> = Arc::downgrade(inner);
    let (stop, mut stopped) = watch::channel(false);
    let handle = runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stopped.changed() => break,
            }
            let Some(pool) = pool.upgrade() else { break };
            pool.evict(min_idle).await;
        }
    });
    Some(Evictor { stop, handle })
}

/// A borrowed item. Dropping it returns the item to its pool.
pub struct Pooled<F: PoolFactory> {
    item: Option<F::Item>,
    pool: Arc<PoolInner<F>>,
    invalid: bool,
    // Released after the item is back in the idle queue.
    _permit: Option<OwnedSemaphorePermit>,
}

impl<F: PoolFactory> Pooled<F> {
    /// Destroys the item instead of returning it.
    pub fn invalidate(mut self) {
        self.invalid = true;
    }

    /// Name of the owning pool.
    #[must_use]
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }
}

impl<F: PoolFactory> Deref for Pooled<F> {
    type Target = F::Item;

    fn deref(&self) -> &Self::Target {
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled item taken before drop"),
        }
    }
}

impl<F: PoolFactory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled item taken before drop"),
        }
    }
}

impl<F: PoolFactory> Drop for Pooled<F> {
    fn drop(&mut self) {
        let Some(item) = self.item.take() else {
            return;
        };
        let pool = &self.pool;
        pool.active.fetch_sub(1, Ordering::SeqCst);

        if !self.invalid {
            let mut idle = pool.idle();
            if !pool.is_closed() && idle.len() < pool.config.max_idle {
                idle.push_front(IdleEntry {
                    item,
                    since: Instant::now(),
                });
                return;
            }
        }
        pool.destroy_in_background(item);
    }
}

impl<F: PoolFactory> fmt::Debug for Pooled<F>
where
    F::Item: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("pool", &self.pool.name)
            .field("item", &self.item)
            .finish()
    }
}

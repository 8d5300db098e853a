//! Lease distributor.
//!
//! A [`Distributor`] repeatedly acquires a lease from its broker, hands it to
//! the registered receiver, and releases it once the receiver is done. Up to
//! `max_degree_of_parallelism` worker loops (never more than the pool size)
//! do this concurrently; the broker guarantees no two of them hold the same
//! resource at once.
//!
//! # Expiry is cooperative
//!
//! A lease that expires while its receiver is still running is given up: the
//! distributor releases it and the resource may be granted to another worker.
//! The first receiver is not cancelled. It can watch
//! [`Lease::expired`](alluvial_core::Lease::expired) to stop early, but until
//! it does, two receivers may be working on the same resource while only one
//! of them holds the lease.
//!
//! # Failure isolation
//!
//! Broker failures and receiver errors or panics are logged and counted; the
//! worker loop carries on with its next cycle.

use crate::config::{ConfigError, DistributorConfig};
use crate::metrics::DistributorMetrics;
use crate::retry::retry_with_backoff;
use alluvial_core::lease::{Lease, LeaseError, SharedLeaseBroker};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Errors from driving a distributor.
#[derive(Error, Debug)]
pub enum DistributorError {
    /// [`Distributor::on_receive`] was called twice.
    #[error("OnReceive has already been called. It can only be called once per distributor.")]
    ReceiverAlreadySet,

    /// The distributor was started before a receiver was registered.
    #[error("No receiver has been registered. Call on_receive before starting the distributor.")]
    NoReceiver,

    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The broker failed while starting up.
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

type Receiver<R> = Arc<dyn Fn(Lease<R>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Counts a lease as active for as long as a cycle holds it, and publishes
/// the count so `stop` can wait for it to reach zero.
struct ActiveLeaseGuard<'a>(&'a watch::Sender<usize>);

impl<'a> ActiveLeaseGuard<'a> {
    fn acquire(active: &'a watch::Sender<usize>) -> Self {
        active.send_modify(|count| *count += 1);
        DistributorMetrics::record_active(*active.borrow());
        Self(active)
    }
}

impl Drop for ActiveLeaseGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
        DistributorMetrics::record_active(*self.0.borrow());
    }
}

struct DistributorInner<R> {
    broker: SharedLeaseBroker<R>,
    config: DistributorConfig,
    receiver: OnceLock<Receiver<R>>,
    running: AtomicBool,
    stopped: AtomicBool,
    stop_signal: watch::Sender<bool>,
    active: watch::Sender<usize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Hands out leases from a broker to a receiver, one resource at a time per
/// worker.
///
/// Clones share the same workers and receiver.
pub struct Distributor<R> {
    inner: Arc<DistributorInner<R>>,
}

impl<R> Clone for Distributor<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> Distributor<R>
where
    R: Clone + Send + Sync + 'static,
{
    /// A stopped distributor over `broker`.
    ///
    /// # Errors
    ///
    /// Returns [`DistributorError::Config`] if `config` does not validate.
    pub fn new(broker: SharedLeaseBroker<R>, config: DistributorConfig) -> Result<Self, DistributorError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(DistributorInner {
                broker,
                config,
                receiver: OnceLock::new(),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(true),
                stop_signal: watch::Sender::new(false),
                active: watch::Sender::new(0),
                workers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Register the callback invoked with each granted lease.
    ///
    /// # Errors
    ///
    /// Returns [`DistributorError::ReceiverAlreadySet`] on a second call.
    pub fn on_receive<F, Fut>(&self, receiver: F) -> Result<(), DistributorError>
    where
        F: Fn(Lease<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let receiver: Receiver<R> = Arc::new(move |lease| receiver(lease).boxed());
        self.inner
            .receiver
            .set(receiver)
            .map_err(|_| DistributorError::ReceiverAlreadySet)
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &DistributorConfig {
        &self.inner.config
    }

    /// Whether worker loops are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Number of leases currently handed to receivers.
    #[must_use]
    pub fn active_leases(&self) -> usize {
        *self.inner.active.borrow()
    }

    /// Spawn the worker loops. Calling `start` on a running distributor does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DistributorError::NoReceiver`] before
    /// [`on_receive`](Self::on_receive), or the broker's error if the pool
    /// size cannot be read.
    pub async fn start(&self) -> Result<(), DistributorError> {
        self.ensure_receiver()?;
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Distributor already running");
            return Ok(());
        }

        let pool_size = match self.inner.broker.pool_size().await {
            Ok(size) => size,
            Err(error) => {
                self.inner.running.store(false, Ordering::Release);
                return Err(error.into());
            }
        };
        let workers = self
            .inner
            .config
            .max_degree_of_parallelism
            .min(pool_size)
            .max(1);

        self.inner.stopped.store(false, Ordering::Release);
        self.inner.stop_signal.send_replace(false);

        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|worker| tokio::spawn(Arc::clone(&self.inner).work(worker)))
            .collect();
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);

        tracing::info!(workers, pool_size, "Distributor started");
        Ok(())
    }

    /// Run `count` acquire/receive/release cycles one after another on the
    /// calling task, returning the resources that were granted. Stops early
    /// when no resource is available.
    ///
    /// # Errors
    ///
    /// Returns [`DistributorError::NoReceiver`] before
    /// [`on_receive`](Self::on_receive).
    pub async fn distribute(&self, count: usize) -> Result<Vec<R>, DistributorError> {
        let receiver = self.ensure_receiver()?;
        let mut granted = Vec::with_capacity(count);
        for _ in 0..count {
            match self.inner.cycle(&receiver).await {
                Some(resource) => granted.push(resource),
                None => break,
            }
        }
        Ok(granted)
    }

    /// Stop acquiring new leases and wait until every held lease has been
    /// released. Running receivers are not interrupted.
    pub async fn stop(&self) {
        tracing::info!("Stopping distributor");
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.stop_signal.send_replace(true);

        let mut active = self.inner.active.subscribe();
        let held = *active.borrow_and_update();
        if held > 0 {
            tracing::debug!(active = held, "Waiting for leases to be released");
        }
        // the sender lives in `inner`, so the channel cannot close here
        let _ = active.wait_for(|count| *count == 0).await;

        let workers = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(error) = worker.await {
                tracing::warn!(error = %error, "Distributor worker ended abnormally");
            }
        }

        self.inner.running.store(false, Ordering::Release);
        tracing::info!("Distributor stopped");
    }

    fn ensure_receiver(&self) -> Result<Receiver<R>, DistributorError> {
        self.inner
            .receiver
            .get()
            .cloned()
            .ok_or(DistributorError::NoReceiver)
    }
}

impl<R> DistributorInner<R>
where
    R: Clone + Send + Sync + 'static,
{
    async fn work(self: Arc<Self>, worker: usize) {
        let Some(receiver) = self.receiver.get().cloned() else {
            return;
        };
        let mut stop = self.stop_signal.subscribe();
        tracing::debug!(worker, "Distributor worker started");

        while !self.stopped.load(Ordering::Acquire) {
            if self.cycle(&receiver).await.is_some() {
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep(self.config.wait_interval) => {}
                _ = stop.changed() => {}
            }
        }

        tracing::debug!(worker, "Distributor worker stopped");
    }

    /// One acquire/receive/release cycle. Returns the granted resource, or
    /// `None` if nothing was acquired.
    #[tracing::instrument(level = "debug", skip_all)]
    async fn cycle(&self, receiver: &Receiver<R>) -> Option<R> {
        let lease = match self
            .broker
            .acquire(self.config.lease_time(), self.config.cooldown())
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => return None,
            Err(error) => {
                tracing::warn!(error = %error, "Failed to acquire lease");
                DistributorMetrics::record_broker_error();
                return None;
            }
        };

        let _active = ActiveLeaseGuard::acquire(&self.active);
        DistributorMetrics::record_granted();
        tracing::debug!(resource = %lease.name(), "Lease received");

        let mut task = tokio::spawn(receiver(lease.clone()));
        tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::error!(resource = %lease.name(), error = %format!("{error:#}"), "Receiver failed");
                    DistributorMetrics::record_receiver_error();
                }
                Err(error) => {
                    tracing::error!(resource = %lease.name(), error = %error, "Receiver panicked");
                    DistributorMetrics::record_receiver_error();
                }
            },
            () = lease.expired() => {
                tracing::warn!(resource = %lease.name(), "Lease expired before the receiver finished");
                DistributorMetrics::record_expired();
            }
            () = tokio::time::sleep(self.config.receive_timeout) => {
                tracing::warn!(resource = %lease.name(), "Receiver timed out");
                DistributorMetrics::record_expired();
            }
        }

        self.release(&lease).await;
        lease.expire();
        Some(lease.resource().clone())
    }

    async fn release(&self, lease: &Lease<R>) {
        let broker = &self.broker;
        if let Err(error) = retry_with_backoff(&self.config.release_retry, "release lease", || {
            broker.release(lease)
        })
        .await
        {
            tracing::error!(resource = %lease.name(), error = %error, "Failed to release lease");
            DistributorMetrics::record_broker_error();
        }
    }
}

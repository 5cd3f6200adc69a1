// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Single-flight operation sequencing.
//!
//! A [`Filesystem`] admits at most one operation at a time. While idle its slot
//! holds the [`MountHandle`]; admission moves the handle into a blocking-pool
//! worker, so nothing else can touch the descriptor until the worker hands the
//! handle back. The handle is restored before the completion target runs,
//! which lets a completion submit the next operation straight away.

use std::future::Future;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::codec::{self, Mapping};
use crate::config::HyprlofsConfig;
use crate::error::{Error, Result, ValidationError};
use crate::handle::{MountHandle, Operation, OperationKind, Outcome};
use crate::sys::{Platform, SystemPlatform};

type Callback = Box<dyn FnOnce(Result<Outcome>) + Send + 'static>;

/// Where the single completion of an admitted operation goes.
pub enum CompletionTarget {
    Channel(oneshot::Sender<Result<Outcome>>),
    Callback(Callback),
}

impl CompletionTarget {
    pub fn callback(callback: impl FnOnce(Result<Outcome>) + Send + 'static) -> Self {
        CompletionTarget::Callback(Box::new(callback))
    }

    fn is_valid(&self) -> bool {
        match self {
            CompletionTarget::Channel(sender) => !sender.is_closed(),
            CompletionTarget::Callback(_) => true,
        }
    }

    fn deliver(self, result: Result<Outcome>) {
        match self {
            CompletionTarget::Channel(sender) => {
                // The receiver may have been dropped since admission.
                let _ = sender.send(result);
            }
            CompletionTarget::Callback(callback) => callback(result),
        }
    }
}

impl std::fmt::Debug for CompletionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionTarget::Channel(_) => f.write_str("CompletionTarget::Channel"),
            CompletionTarget::Callback(_) => f.write_str("CompletionTarget::Callback"),
        }
    }
}

/// Conversion from a completion's [`Outcome`] to the value a typed
/// [`Pending`] resolves to.
pub trait FromOutcome: Sized {
    fn from_outcome(outcome: Outcome) -> Self;
}

impl FromOutcome for () {
    fn from_outcome(_: Outcome) -> Self {}
}

impl FromOutcome for Vec<Mapping> {
    fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Listing(mappings) => mappings,
            Outcome::Completed => Vec::new(),
        }
    }
}

impl FromOutcome for Outcome {
    fn from_outcome(outcome: Outcome) -> Self {
        outcome
    }
}

/// Completion of an admitted operation.
///
/// The operation runs whether or not this future is polled; dropping it only
/// discards the result.
#[derive(Debug)]
#[must_use = "the operation runs regardless; await this to observe its result"]
pub struct Pending<T> {
    op: &'static str,
    receiver: oneshot::Receiver<Result<Outcome>>,
    _output: PhantomData<fn() -> T>,
}

impl<T: FromOutcome> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let op = self.op;
        Pin::new(&mut self.receiver).poll(cx).map(|received| match received {
            Ok(result) => result.map(T::from_outcome),
            Err(_) => Err(Error::Abandoned { op }),
        })
    }
}

enum Slot<P: Platform> {
    Idle(MountHandle<P>),
    Pending(OperationKind),
}

struct Shared<P: Platform> {
    label: PathBuf,
    platform: Arc<P>,
    config: HyprlofsConfig,
    slot: Mutex<Slot<P>>,
}

impl<P: Platform> Shared<P> {
    fn slot(&self) -> MutexGuard<'_, Slot<P>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh_handle(&self) -> MountHandle<P> {
        MountHandle::new(Arc::clone(&self.platform), self.label.clone(), &self.config)
    }

    fn release(&self, handle: MountHandle<P>) {
        *self.slot() = Slot::Idle(handle);
    }
}

/// Administrative access to one hyprlofs mountpoint.
///
/// Clones share the same handle and therefore the same single-flight slot.
pub struct Filesystem<P: Platform = SystemPlatform> {
    shared: Arc<Shared<P>>,
}

impl<P: Platform> Clone for Filesystem<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Platform> std::fmt::Debug for Filesystem<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("label", &self.shared.label)
            .field("pending", &self.pending_kind())
            .finish()
    }
}

impl Filesystem<SystemPlatform> {
    /// Administer the hyprlofs mountpoint at `label` on this host.
    pub fn new(label: impl Into<PathBuf>, config: HyprlofsConfig) -> Self {
        Self::with_platform(Arc::new(SystemPlatform), label, config)
    }
}

impl<P: Platform> Filesystem<P> {
    pub fn with_platform(platform: Arc<P>, label: impl Into<PathBuf>, config: HyprlofsConfig) -> Self {
        let label = label.into();
        let handle = MountHandle::new(Arc::clone(&platform), label.clone(), &config);
        Self {
            shared: Arc::new(Shared {
                label,
                platform,
                config,
                slot: Mutex::new(Slot::Idle(handle)),
            }),
        }
    }

    pub fn label(&self) -> &Path {
        &self.shared.label
    }

    pub fn config(&self) -> &HyprlofsConfig {
        &self.shared.config
    }

    pub fn is_pending(&self) -> bool {
        self.pending_kind().is_some()
    }

    /// Kind of the operation currently in flight, if any.
    pub fn pending_kind(&self) -> Option<OperationKind> {
        match &*self.shared.slot() {
            Slot::Idle(_) => None,
            Slot::Pending(kind) => Some(*kind),
        }
    }

    /// Admit `operation` and arrange for `target` to receive its result
    /// exactly once.
    ///
    /// Fails without starting any work when `target` can no longer receive a
    /// result, when another operation is pending, or when called outside a
    /// tokio runtime. The target is checked first.
    pub fn submit(&self, operation: Operation, target: CompletionTarget) -> Result<()> {
        let kind = operation.kind();
        let op = kind.method();

        let (mut handle, runtime) = {
            let mut slot = self.shared.slot();
            if !target.is_valid() {
                return Err(Error::InvalidCompletion { op });
            }
            if let Slot::Pending(running) = &*slot {
                debug!(
                    operation = "operation_rejected",
                    mountpoint = %self.shared.label.display(),
                    method = op,
                    running = running.method(),
                    "Operation already in progress"
                );
                return Err(Error::Busy { op });
            }
            let runtime = Handle::try_current().map_err(|_| Error::NoRuntime { op })?;
            let Slot::Idle(handle) = std::mem::replace(&mut *slot, Slot::Pending(kind)) else {
                return Err(Error::Busy { op });
            };
            (handle, runtime)
        };

        debug!(
            operation = "operation_admitted",
            mountpoint = %self.shared.label.display(),
            method = op,
            "Operation admitted"
        );

        let worker = runtime.spawn_blocking(move || {
            let result = handle.execute(operation);
            (handle, result)
        });
        let shared = Arc::clone(&self.shared);
        runtime.spawn(async move {
            let result = match worker.await {
                Ok((handle, result)) => {
                    shared.release(handle);
                    result.into_outcome(&shared.label).map_err(Error::from)
                }
                Err(join_error) => {
                    shared.release(shared.fresh_handle());
                    if join_error.is_panic() {
                        error!(
                            operation = "operation_panicked",
                            mountpoint = %shared.label.display(),
                            method = op,
                            "Worker panicked; control descriptor discarded"
                        );
                        Err(Error::WorkerPanicked { op })
                    } else {
                        Err(Error::Abandoned { op })
                    }
                }
            };
            debug!(
                operation = "operation_completed",
                mountpoint = %shared.label.display(),
                method = op,
                success = result.is_ok(),
                "Operation completed"
            );
            target.deliver(result);
        });
        Ok(())
    }

    /// Like [`Filesystem::submit`], delivering the result to `callback`.
    pub fn submit_with(
        &self,
        operation: Operation,
        callback: impl FnOnce(Result<Outcome>) + Send + 'static,
    ) -> Result<()> {
        self.submit(operation, CompletionTarget::callback(callback))
    }

    fn enqueue<T: FromOutcome>(&self, operation: Operation) -> Result<Pending<T>> {
        let op = operation.kind().method();
        let (sender, receiver) = oneshot::channel();
        self.submit(operation, CompletionTarget::Channel(sender))?;
        Ok(Pending {
            op,
            receiver,
            _output: PhantomData,
        })
    }

    pub fn mount(&self) -> Result<Pending<()>> {
        self.enqueue(Operation::Mount)
    }

    pub fn unmount(&self) -> Result<Pending<()>> {
        self.enqueue(Operation::Unmount)
    }

    pub fn add_mappings<I, R, N>(&self, pairs: I) -> Result<Pending<()>>
    where
        I: IntoIterator<Item = (R, N)>,
        R: AsRef<str>,
        N: AsRef<str>,
    {
        let entries = codec::encode_add(pairs).map_err(validation(OperationKind::AddMappings))?;
        self.enqueue(Operation::AddMappings(entries))
    }

    /// Add mappings given as `[["/real/path", "name"], ...]`.
    pub fn add_mappings_value(&self, pairs: &Value) -> Result<Pending<()>> {
        let entries =
            codec::encode_add_value(pairs).map_err(validation(OperationKind::AddMappings))?;
        self.enqueue(Operation::AddMappings(entries))
    }

    pub fn remove_mappings<I, S>(&self, names: I) -> Result<Pending<()>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries =
            codec::encode_remove(names).map_err(validation(OperationKind::RemoveMappings))?;
        self.enqueue(Operation::RemoveMappings(entries))
    }

    /// Remove mappings given as `["name", ...]`.
    pub fn remove_mappings_value(&self, names: &Value) -> Result<Pending<()>> {
        let entries =
            codec::encode_remove_value(names).map_err(validation(OperationKind::RemoveMappings))?;
        self.enqueue(Operation::RemoveMappings(entries))
    }

    pub fn remove_all(&self) -> Result<Pending<()>> {
        self.enqueue(Operation::RemoveAll)
    }

    pub fn list_mappings(&self) -> Result<Pending<Vec<Mapping>>> {
        self.enqueue(Operation::ListMappings)
    }
}

fn validation(kind: OperationKind) -> impl FnOnce(ValidationError) -> Error {
    move |source| Error::Validation {
        op: kind.method(),
        source,
    }
}

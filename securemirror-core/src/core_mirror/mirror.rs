//! The secure mirror facade
//!
//! A [`SecureMirror`] replicates one record type for one principal. Reads
//! are served from the permission-filtered local view; writes go to the
//! store after a local permission check and then fan membership changes out
//! through the [`UsersMembershipUpdater`].
//!
//! A mirror is either bound to the type root (the principal may read every
//! record) or driven by the principal's personal index.

use super::child::{forward, ChildState, SubscriptionGuard};
use super::errors::{AggregateFailure, FailedTarget, MirrorError, MirrorResult};
use super::events::{EventBus, EventKind, HandlerToken, MirrorEvent};
use super::snapshot::{MirrorRecord, Snapshot};
use super::translator::{BindMode, Command, EventTranslator, Inbound, Source};
use crate::core_membership::{MembershipReport, UserQueueReconciler, UsersMembershipUpdater};
use crate::core_policy::{
    is_member, members, MembershipDiff, PermissionEvaluator, PrincipalContext, TypePolicy,
};
use crate::core_remote::{RemoteStore, StorePath, TransactionResult, TransactionUpdate};
use crate::metrics;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of a mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    Uninitialized,
    /// Subscribed to the whole type root
    RootBound,
    /// Materializing the records listed in the personal index
    LoadingForUser,
    /// Personal-index load finished
    Ready,
    TornDown,
}

impl fmt::Display for MirrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MirrorState::Uninitialized => "uninitialized",
            MirrorState::RootBound => "root_bound",
            MirrorState::LoadingForUser => "loading_for_user",
            MirrorState::Ready => "ready",
            MirrorState::TornDown => "torn_down",
        };
        f.write_str(name)
    }
}

/// Tagged result of a successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    RecordCreated {
        id: String,
        membership: MembershipReport,
    },
    RecordUpdated {
        id: String,
        membership: MembershipReport,
    },
    RecordRemoved {
        id: String,
        membership: MembershipReport,
    },
}

impl WriteOutcome {
    pub fn id(&self) -> &str {
        match self {
            WriteOutcome::RecordCreated { id, .. }
            | WriteOutcome::RecordUpdated { id, .. }
            | WriteOutcome::RecordRemoved { id, .. } => id,
        }
    }

    pub fn membership(&self) -> &MembershipReport {
        match self {
            WriteOutcome::RecordCreated { membership, .. }
            | WriteOutcome::RecordUpdated { membership, .. }
            | WriteOutcome::RecordRemoved { membership, .. } => membership,
        }
    }
}

/// Collaborators shared by every mirror of one session
#[derive(Clone)]
pub struct MirrorContext {
    pub store: Arc<dyn RemoteStore>,
    pub evaluator: PermissionEvaluator,
    /// `None` for an anonymous session
    pub principal: Option<Arc<PrincipalContext>>,
    /// Buffer size of each mirror's broadcast stream
    pub event_capacity: usize,
}

impl MirrorContext {
    pub fn new(store: Arc<dyn RemoteStore>, principal: Option<Arc<PrincipalContext>>) -> Self {
        MirrorContext {
            store,
            evaluator: PermissionEvaluator::default(),
            principal,
            event_capacity: 256,
        }
    }

    pub fn with_evaluator(mut self, evaluator: PermissionEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadSignal {
    Pending,
    Loaded,
    TornDown,
}

pub(crate) struct MirrorShared {
    pub(crate) state: MirrorState,
    pub(crate) children: BTreeMap<String, ChildState>,
    pub(crate) reconcile_failures: Vec<FailedTarget>,
    pub(crate) reconcile_attempted: usize,
}

pub(crate) struct MirrorInner {
    pub(crate) type_name: String,
    pub(crate) policy: TypePolicy,
    pub(crate) store: Arc<dyn RemoteStore>,
    pub(crate) evaluator: PermissionEvaluator,
    pub(crate) principal: Option<Arc<PrincipalContext>>,
    pub(crate) bus: EventBus,
    pub(crate) shared: RwLock<MirrorShared>,
    pub(crate) inbox: mpsc::UnboundedSender<Inbound>,
    pub(crate) reconciler: Option<UserQueueReconciler>,
    updater: UsersMembershipUpdater,
    mode: Mutex<Option<BindMode>>,
    torn_down: AtomicBool,
    load_signal: watch::Sender<LoadSignal>,
    guards: Mutex<Vec<SubscriptionGuard>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Inbox receiver, held until `start` hands it to the event loop
    pending_inbox: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MirrorInner {
    pub(crate) fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    pub(crate) async fn is_tracked(&self, id: &str) -> bool {
        self.shared.read().await.children.contains_key(id)
    }

    pub(crate) async fn prev_id_of(&self, id: &str) -> Option<String> {
        self.shared
            .read()
            .await
            .children
            .get(id)
            .and_then(|child| child.prev_id.clone())
    }

    /// Evaluate read access for one record against the current principal
    pub(crate) async fn permits(&self, id: &str, value: Option<&Value>) -> bool {
        match &self.principal {
            Some(principal) => {
                let principal = principal.read().await;
                self.evaluator
                    .permit(Some(&*principal), &self.policy, Some(id), value)
            }
            None => self.evaluator.permit(None, &self.policy, Some(id), value),
        }
    }

    /// Visible records, re-gated now
    pub(crate) async fn snapshot(&self) -> Snapshot {
        let guard = match &self.principal {
            Some(principal) => Some(principal.read().await),
            None => None,
        };
        let principal = guard.as_deref();
        let shared = self.shared.read().await;

        let mut snapshot = Snapshot::empty(&self.type_name);
        for (id, child) in &shared.children {
            let Some(value) = child.visible_value() else {
                continue;
            };
            if self
                .evaluator
                .permit(principal, &self.policy, Some(id), Some(value))
            {
                snapshot.records.insert(id.clone(), value.clone());
            }
        }
        snapshot
    }

    pub(crate) fn signal_loaded(&self) {
        self.load_signal.send_replace(LoadSignal::Loaded);
    }

    pub(crate) async fn has_failed_target(&self, target: &str) -> bool {
        self.shared
            .read()
            .await
            .reconcile_failures
            .iter()
            .any(|failure| failure.target == target)
    }

    pub(crate) async fn record_reconcile_failure(&self, failure: FailedTarget) {
        let mut shared = self.shared.write().await;
        shared.reconcile_attempted += 1;
        shared.reconcile_failures.push(failure);
    }

    async fn attach(&self, source: Source, path: StorePath) -> MirrorResult<()> {
        let subscription = self.store.on(&path).await?;
        if self.is_torn_down() {
            self.store.off(subscription.id()).await;
            return Err(MirrorError::TornDown(self.type_name.clone()));
        }
        let guard = forward(subscription, source, self.inbox.clone());
        locked(&self.guards).push(guard);
        debug!(%path, "mirror attached");
        Ok(())
    }
}

/// Permission-filtered live replica of one record type
#[derive(Clone)]
pub struct SecureMirror {
    inner: Arc<MirrorInner>,
}

impl fmt::Debug for SecureMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureMirror")
            .field("type_name", &self.inner.type_name)
            .field("principal", &self.principal_id())
            .field("torn_down", &self.inner.is_torn_down())
            .finish()
    }
}

impl SecureMirror {
    /// Open a mirror and start replicating
    ///
    /// Drains the principal's pending queue for the type first. Drain
    /// failures are kept in [`reconcile_failures`](Self::reconcile_failures)
    /// and never fail the open.
    ///
    /// The initial `value` + `loaded` pair may already be published when
    /// this returns. Register handlers between [`create`](Self::create) and
    /// [`start`](Self::start) to observe it, or wait on
    /// [`loaded`](Self::loaded).
    pub async fn open(ctx: MirrorContext, policy: TypePolicy) -> MirrorResult<Self> {
        let mirror = Self::create(ctx, policy)?;
        mirror.start().await?;
        Ok(mirror)
    }

    /// Build a mirror without touching the store
    ///
    /// Nothing is subscribed and no event is published until
    /// [`start`](Self::start).
    pub fn create(ctx: MirrorContext, policy: TypePolicy) -> MirrorResult<Self> {
        policy.validate()?;
        let type_name = policy.name.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let (load_signal, _) = watch::channel(LoadSignal::Pending);
        let reconciler = ctx
            .principal
            .as_ref()
            .map(|p| UserQueueReconciler::new(ctx.store.clone(), p.clone(), &type_name));
        let updater = match &ctx.principal {
            Some(p) => UsersMembershipUpdater::new(ctx.store.clone(), p.clone(), &type_name),
            None => UsersMembershipUpdater::anonymous(ctx.store.clone(), &type_name),
        };

        let inner = Arc::new(MirrorInner {
            type_name,
            policy,
            store: ctx.store,
            evaluator: ctx.evaluator,
            principal: ctx.principal,
            bus: EventBus::new(ctx.event_capacity),
            shared: RwLock::new(MirrorShared {
                state: MirrorState::Uninitialized,
                children: BTreeMap::new(),
                reconcile_failures: Vec::new(),
                reconcile_attempted: 0,
            }),
            inbox: tx,
            reconciler,
            updater,
            mode: Mutex::new(None),
            torn_down: AtomicBool::new(false),
            load_signal,
            guards: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
            pending_inbox: Mutex::new(Some(rx)),
        });
        Ok(SecureMirror { inner })
    }

    /// Drain the queue, pick the bind mode and begin replicating
    ///
    /// Only the first call does anything; later calls return immediately.
    pub async fn start(&self) -> MirrorResult<()> {
        self.ensure_live()?;
        let Some(rx) = locked(&self.inner.pending_inbox).take() else {
            return Ok(());
        };
        let timer = metrics::Timer::new(metrics::OPEN_DURATION);

        self.reconcile().await;

        let mode = if self.has_root_access().await {
            BindMode::Root
        } else {
            BindMode::Index
        };
        *locked(&self.inner.mode) = Some(mode);

        let translator = EventTranslator::new(Arc::downgrade(&self.inner), rx, mode);
        *locked(&self.inner.worker) = Some(tokio::spawn(translator.run()));

        if let Err(e) = self.bind(mode).await {
            self.destroy().await;
            return Err(e);
        }

        timer.stop();
        info!(
            type_name = %self.inner.type_name,
            principal = self.principal_id().unwrap_or("anonymous"),
            mode = ?mode,
            "mirror opened"
        );
        Ok(())
    }

    async fn reconcile(&self) {
        let Some(reconciler) = &self.inner.reconciler else {
            return;
        };
        let failure = match reconciler.drain().await {
            Ok(report) => {
                debug!(applied = report.applied.len(), "queue drained before open");
                return;
            }
            Err(MirrorError::Aggregate(failure)) => failure,
            Err(other) => AggregateFailure::new(
                1,
                vec![FailedTarget {
                    target: StorePath::user_queue(reconciler.principal_id(), reconciler.type_name())
                        .to_string(),
                    cause: other.to_string(),
                }],
            ),
        };
        warn!(
            type_name = %self.inner.type_name,
            failed = failure.failures.len(),
            "opening with unreconciled queue entries"
        );
        let mut shared = self.inner.shared.write().await;
        shared.reconcile_attempted += failure.attempted;
        shared.reconcile_failures.extend(failure.failures);
    }

    async fn has_root_access(&self) -> bool {
        match &self.inner.principal {
            Some(principal) => {
                let principal = principal.read().await;
                self.inner
                    .evaluator
                    .permit(Some(&*principal), &self.inner.policy, None, None)
            }
            None => self
                .inner
                .evaluator
                .permit(None, &self.inner.policy, None, None),
        }
    }

    async fn bind(&self, mode: BindMode) -> MirrorResult<()> {
        let inner = &self.inner;
        match mode {
            BindMode::Root => {
                inner.shared.write().await.state = MirrorState::RootBound;
                inner
                    .attach(Source::Root, StorePath::type_root(&inner.type_name))
                    .await?;
            }
            BindMode::Index => {
                inner.shared.write().await.state = MirrorState::LoadingForUser;
                // Queued ahead of the index burst so the load sees local state first.
                self.send(Command::LoadForUser { reply: None })?;
                if let Some(principal) = &inner.principal {
                    inner
                        .attach(
                            Source::Index,
                            StorePath::user_index(principal.id(), &inner.type_name),
                        )
                        .await?;
                }
            }
        }
        if let Some(principal) = &inner.principal {
            inner
                .attach(
                    Source::Queue,
                    StorePath::user_queue(principal.id(), &inner.type_name),
                )
                .await?;
        }
        Ok(())
    }

    fn send(&self, command: Command) -> MirrorResult<()> {
        self.inner
            .inbox
            .send(Inbound::Command(command))
            .map_err(|_| MirrorError::TornDown(self.inner.type_name.clone()))
    }

    fn ensure_live(&self) -> MirrorResult<()> {
        if self.inner.is_torn_down() {
            return Err(MirrorError::TornDown(self.inner.type_name.clone()));
        }
        Ok(())
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn policy(&self) -> &TypePolicy {
        &self.inner.policy
    }

    pub fn principal_id(&self) -> Option<&str> {
        self.inner.principal.as_ref().map(|p| p.id())
    }

    pub async fn state(&self) -> MirrorState {
        self.inner.shared.read().await.state
    }

    /// True when bound to the whole type root
    pub fn is_root_bound(&self) -> bool {
        *locked(&self.inner.mode) == Some(BindMode::Root)
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.is_torn_down()
    }

    /// Wait until the initial load has completed
    pub async fn loaded(&self) -> MirrorResult<()> {
        let mut rx = self.inner.load_signal.subscribe();
        loop {
            match *rx.borrow_and_update() {
                LoadSignal::Loaded => return Ok(()),
                LoadSignal::TornDown => {
                    return Err(MirrorError::TornDown(self.inner.type_name.clone()))
                }
                LoadSignal::Pending => {}
            }
            rx.changed()
                .await
                .map_err(|_| MirrorError::TornDown(self.inner.type_name.clone()))?;
        }
    }

    /// Load every record listed in the personal index
    ///
    /// Runs once on open for index-driven mirrors. Calling it again, or on
    /// a root-bound mirror, only waits for the load that already happened.
    pub async fn load_for_user(&self) -> MirrorResult<()> {
        self.start().await?;
        if !self.is_root_bound() {
            let (reply, done) = oneshot::channel();
            self.send(Command::LoadForUser { reply: Some(reply) })?;
            done.await
                .map_err(|_| MirrorError::TornDown(self.inner.type_name.clone()))?;
        }
        self.loaded().await
    }

    /// Queue entries that could not be applied, if any
    pub async fn reconcile_failures(&self) -> Option<AggregateFailure> {
        let shared = self.inner.shared.read().await;
        if shared.reconcile_failures.is_empty() {
            return None;
        }
        Some(AggregateFailure::new(
            shared.reconcile_attempted,
            shared.reconcile_failures.clone(),
        ))
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.snapshot().await
    }

    /// One record's value, re-gated at call time
    pub async fn snapshot_child(&self, id: &str) -> Option<Value> {
        let value = {
            let shared = self.inner.shared.read().await;
            shared.children.get(id)?.visible_value()?.clone()
        };
        if self.inner.permits(id, Some(&value)).await {
            Some(value)
        } else {
            None
        }
    }

    pub async fn child(&self, id: &str) -> Option<MirrorRecord> {
        self.snapshot_child(id)
            .await
            .map(|value| MirrorRecord::new(id, value))
    }

    /// Ids of the visible records, in snapshot order
    pub async fn get_index(&self) -> Vec<String> {
        self.snapshot()
            .await
            .ids()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Position of `id` among the visible records
    pub async fn position_of(&self, id: &str) -> Option<usize> {
        self.snapshot().await.index_of(id)
    }

    pub async fn as_array(&self) -> Vec<MirrorRecord> {
        self.snapshot().await.to_array()
    }

    /// Register a handler for one event kind
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerToken
    where
        F: Fn(&MirrorEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, Arc::new(handler))
    }

    pub fn off(&self, token: HandlerToken) -> bool {
        self.inner.bus.off(token)
    }

    /// Stream of every published event
    pub fn subscribe(&self) -> broadcast::Receiver<MirrorEvent> {
        self.inner.bus.subscribe()
    }

    fn deny(&self, action: &str) -> MirrorError {
        metrics::record_counter(metrics::WRITES_DENIED, 1);
        let principal = self.principal_id().unwrap_or("anonymous").to_string();
        warn!(
            principal = %principal,
            type_name = %self.inner.type_name,
            action,
            "write denied"
        );
        MirrorError::PermissionDenied {
            principal,
            action: action.to_string(),
            type_name: self.inner.type_name.clone(),
        }
    }

    fn not_found(&self, id: &str) -> MirrorError {
        MirrorError::NotFound {
            type_name: self.inner.type_name.clone(),
            id: id.to_string(),
        }
    }

    async fn visible_or_not_found(&self, id: &str) -> MirrorResult<Value> {
        self.snapshot_child(id)
            .await
            .ok_or_else(|| self.not_found(id))
    }

    /// Create a record under a fresh id
    ///
    /// Allowed with type-level access, or when the record lists the acting
    /// principal as a member.
    pub async fn add(&self, value: Value) -> MirrorResult<WriteOutcome> {
        self.ensure_live()?;
        let allowed = match &self.inner.principal {
            Some(principal) => {
                let principal = principal.read().await;
                self.inner
                    .evaluator
                    .can_write_type(Some(&*principal), &self.inner.policy)
                    || is_member(&value, &principal.id)
            }
            None => self.inner.evaluator.can_write_type(None, &self.inner.policy),
        };
        if !allowed {
            return Err(self.deny("add"));
        }

        let id = self.inner.store.push_id();
        let path = StorePath::record(&self.inner.type_name, &id);
        self.inner.store.set(&path, value.clone()).await?;
        debug!(%path, "record created");

        let membership = self.inner.updater.add(&id, &members(Some(&value))).await?;
        Ok(WriteOutcome::RecordCreated { id, membership })
    }

    /// Delete a visible record and withdraw it from its members
    pub async fn remove(&self, id: &str) -> MirrorResult<WriteOutcome> {
        self.ensure_live()?;
        let previous = self.visible_or_not_found(id).await?;

        let mut prior = members(Some(&previous));
        if let Some(principal) = &self.inner.principal {
            if principal.read().await.index.contains(&self.inner.type_name, id) {
                prior.insert(principal.id().to_string());
            }
        }

        let path = StorePath::record(&self.inner.type_name, id);
        self.inner.store.remove(&path).await?;
        debug!(%path, "record removed");

        let membership = self.inner.updater.remove(id, &prior).await?;
        Ok(WriteOutcome::RecordRemoved {
            id: id.to_string(),
            membership,
        })
    }

    /// Replace a visible record
    pub async fn set(&self, id: &str, value: Value) -> MirrorResult<WriteOutcome> {
        self.ensure_live()?;
        let previous = self.visible_or_not_found(id).await?;

        let path = StorePath::record(&self.inner.type_name, id);
        self.inner.store.set(&path, value.clone()).await?;

        let diff = MembershipDiff::between(Some(&previous), Some(&value));
        self.finish_update(id, diff).await
    }

    /// Write back a record obtained from this mirror
    pub async fn save(&self, record: MirrorRecord) -> MirrorResult<WriteOutcome> {
        self.set(&record.id, record.value).await
    }

    /// Merge top-level fields into a visible record; `null` deletes a field
    pub async fn update(&self, id: &str, fields: Map<String, Value>) -> MirrorResult<WriteOutcome> {
        self.ensure_live()?;
        let previous = self.visible_or_not_found(id).await?;

        let mut merged = previous.as_object().cloned().unwrap_or_default();
        for (key, value) in &fields {
            if value.is_null() {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }

        let path = StorePath::record(&self.inner.type_name, id);
        self.inner.store.update(&path, fields).await?;

        let diff = MembershipDiff::between(Some(&previous), Some(&Value::Object(merged)));
        self.finish_update(id, diff).await
    }

    async fn finish_update(&self, id: &str, diff: MembershipDiff) -> MirrorResult<WriteOutcome> {
        let membership = self
            .inner
            .updater
            .apply_diff(id, &diff.added, &diff.removed)
            .await?;
        Ok(WriteOutcome::RecordUpdated {
            id: id.to_string(),
            membership,
        })
    }

    /// Share a record with more principals
    ///
    /// The record must be visible, unless the principal has type-level
    /// access. The acting principal's index is written directly; everyone
    /// else gets a queue entry.
    pub async fn add_to_users(
        &self,
        id: &str,
        principal_ids: &BTreeSet<String>,
    ) -> MirrorResult<MembershipReport> {
        self.ensure_live()?;
        self.require_membership_authority(id, "add_to_users").await?;
        self.inner.updater.add(id, principal_ids).await
    }

    /// Withdraw a record from principals without touching the record
    pub async fn remove_from_users(
        &self,
        id: &str,
        principal_ids: &BTreeSet<String>,
    ) -> MirrorResult<MembershipReport> {
        self.ensure_live()?;
        self.require_membership_authority(id, "remove_from_users").await?;
        self.inner.updater.remove(id, principal_ids).await
    }

    async fn require_membership_authority(&self, id: &str, action: &str) -> MirrorResult<()> {
        if self.snapshot_child(id).await.is_some() || self.has_root_access().await {
            return Ok(());
        }
        Err(self.deny(action))
    }

    /// Atomic read-modify-write of one record, or of the whole type with `None`
    ///
    /// Only allowed with type-level access. `update` sees the stored value,
    /// not the filtered view, and may run more than once. Membership is not
    /// propagated for values written this way.
    pub async fn transaction<F>(
        &self,
        id: Option<&str>,
        mut update: F,
    ) -> MirrorResult<TransactionResult>
    where
        F: FnMut(Option<&Value>) -> TransactionUpdate + Send,
    {
        self.ensure_live()?;
        if !self.has_root_access().await {
            return Err(self.deny("transaction"));
        }
        let path = match id {
            Some(id) => StorePath::record(&self.inner.type_name, id),
            None => StorePath::type_root(&self.inner.type_name),
        };
        let result = self.inner.store.transaction(&path, &mut update).await?;
        debug!(%path, committed = result.committed, "mirror transaction finished");
        Ok(result)
    }

    /// Release every subscription and stop publishing
    ///
    /// Idempotent. Handlers are dropped; pending `loaded` waiters resolve
    /// with [`MirrorError::TornDown`].
    pub async fn destroy(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;
        let _ = inner.inbox.send(Inbound::Command(Command::Shutdown));
        if let Some(worker) = locked(&inner.worker).take() {
            worker.abort();
        }
        locked(&inner.pending_inbox).take();

        let mut released: Vec<SubscriptionGuard> = locked(&inner.guards).drain(..).collect();
        {
            let mut shared = inner.shared.write().await;
            released.extend(std::mem::take(&mut shared.children).into_values().map(|c| c.guard));
            shared.state = MirrorState::TornDown;
        }
        for guard in &released {
            inner.store.off(guard.id()).await;
        }
        let count = released.len();
        drop(released);

        inner.bus.clear();
        inner.load_signal.send_replace(LoadSignal::TornDown);
        metrics::record_gauge(metrics::CHILDREN_TRACKED, 0.0);
        info!(type_name = %inner.type_name, subscriptions = count, "mirror torn down");
    }
}

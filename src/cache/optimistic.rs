//! Optimistic mutations.
//!
//! A mutation is applied to the store before the server sees it, then either
//! reconciled with the server's record or rolled back. Each pending mutation
//! leaves an [`Overlay`] in the store so fetches that land mid-flight keep the
//! optimistic state, and so a rollback only undoes its own change.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::invalidation::{InvalidationRules, MutationEvent};
use super::manager::CacheManager;
use super::record::{Collection, CollectionName, Record, RecordId};
use super::store::EntityStore;
use crate::error::CacheError;
use crate::notify::{NotificationKind, NotificationSink};
use crate::permissions::{Action, Permission, PermissionOracle};
use crate::remote::{BoxFuture, MutationOp, RemoteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

impl MutationId {
  pub(crate) fn new(seq: u64) -> Self {
    Self(seq)
  }
}

impl fmt::Display for MutationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Lifecycle of one mutation: `Pending -> (Succeeded | RolledBack)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
  Pending,
  Succeeded,
  RolledBack,
}

/// Local effect of a pending mutation.
#[derive(Debug, Clone)]
pub(crate) enum OverlayKind {
  /// Placeholder record shown at the head of the collection
  Insert(Arc<Record>),
  Patch { id: RecordId, patch: Record },
  Remove(RecordId),
}

impl OverlayKind {
  fn apply(&self, records: &mut Vec<Arc<Record>>) {
    match self {
      Self::Insert(record) => {
        let present = record
          .id()
          .is_some_and(|id| position(records, &id).is_some());
        if !present {
          records.insert(0, Arc::clone(record));
        }
      }
      Self::Patch { id, patch } => {
        if let Some(pos) = position(records, id) {
          let current = &records[pos];
          let differs = patch
            .fields()
            .iter()
            .any(|(field, value)| field != "id" && current.get(field) != Some(value));
          if differs {
            let patched = Arc::new(current.overlay(patch));
            records[pos] = patched;
          }
        }
      }
      Self::Remove(id) => records.retain(|r| r.id().as_ref() != Some(id)),
    }
  }
}

#[derive(Debug, Clone)]
pub(crate) struct Overlay {
  pub mutation: MutationId,
  pub kind: OverlayKind,
}

/// Apply pending overlays, oldest first, on top of `records`. Idempotent.
pub(crate) fn reapply(mut records: Vec<Arc<Record>>, overlays: &[Overlay]) -> Vec<Arc<Record>> {
  for overlay in overlays {
    overlay.kind.apply(&mut records);
  }
  records
}

fn position(records: &[Arc<Record>], id: &RecordId) -> Option<usize> {
  records.iter().position(|r| r.id().as_ref() == Some(id))
}

/// What a mutation changed locally, kept for reconcile and rollback.
#[derive(Debug, Clone)]
enum Touched {
  Created { placeholder: RecordId },
  Updated { id: RecordId },
  Deleted { id: RecordId },
}

#[derive(Debug, Clone)]
struct Snapshot {
  /// Collection as it was right before the optimistic apply
  previous: Arc<Collection>,
  /// Server copy known at that point
  base: Option<Arc<Collection>>,
  touched: Touched,
}

impl Snapshot {
  /// Last-known-good copy to restore from: the snapshot, unless a fetch has
  /// committed since the mutation began.
  fn restore_source(&self, latest: Option<Arc<Collection>>) -> Arc<Collection> {
    match (latest, &self.base) {
      (Some(latest), Some(base)) if Arc::ptr_eq(&latest, base) => Arc::clone(&self.previous),
      (Some(latest), _) => latest,
      (None, _) => Arc::clone(&self.previous),
    }
  }
}

/// Maps a record to another record. Used to build the optimistic record from
/// a payload and to normalise the server's answer.
pub type RecordProjection = Arc<dyn Fn(Record) -> Record + Send + Sync>;

/// Picks the event to emit from the server's record.
pub type EventSelector = Arc<dyn Fn(&Record) -> MutationEvent + Send + Sync>;

#[derive(Clone)]
enum Emits {
  Fixed(MutationEvent),
  FromServer(EventSelector),
}

impl fmt::Debug for Emits {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Fixed(event) => write!(f, "{event}"),
      Self::FromServer(_) => f.write_str("<from server record>"),
    }
  }
}

/// Everything needed to run one mutation.
#[derive(Clone)]
pub struct MutationSpec {
  collection: CollectionName,
  op: MutationOp,
  event: Option<Emits>,
  permission: Option<Permission>,
  project: Option<RecordProjection>,
  reconcile: Option<RecordProjection>,
  label: String,
}

impl MutationSpec {
  fn with_op(collection: CollectionName, op: MutationOp) -> Self {
    let label = format!("{} {}", op.verb(), collection);
    Self {
      collection,
      op,
      event: None,
      permission: None,
      project: None,
      reconcile: None,
      label,
    }
  }

  pub fn create(collection: CollectionName, payload: Record) -> Self {
    Self::with_op(collection, MutationOp::Create { payload })
  }

  pub fn update(collection: CollectionName, id: RecordId, patch: Record) -> Self {
    Self::with_op(collection, MutationOp::Update { id, patch })
  }

  pub fn delete(collection: CollectionName, id: RecordId) -> Self {
    Self::with_op(collection, MutationOp::Delete { id })
  }

  /// Event whose dependent collections are refreshed after success.
  pub fn emits(mut self, event: MutationEvent) -> Self {
    self.event = Some(Emits::Fixed(event));
    self
  }

  /// Like [`emits`](Self::emits), but the event depends on what the server
  /// returned, e.g. the status of a deleted row.
  pub fn emits_from(
    mut self,
    f: impl Fn(&Record) -> MutationEvent + Send + Sync + 'static,
  ) -> Self {
    self.event = Some(Emits::FromServer(Arc::new(f)));
    self
  }

  /// Override the permission checked before anything is applied.
  /// Defaults to `<collection>.<create|update|delete>`.
  pub fn requires(mut self, permission: Permission) -> Self {
    self.permission = Some(permission);
    self
  }

  /// Build the optimistic record from the create payload, or the optimistic
  /// patch from the update patch.
  pub fn project(mut self, f: impl Fn(Record) -> Record + Send + Sync + 'static) -> Self {
    self.project = Some(Arc::new(f));
    self
  }

  /// Normalise the server's record before it replaces the optimistic one.
  pub fn reconcile(mut self, f: impl Fn(Record) -> Record + Send + Sync + 'static) -> Self {
    self.reconcile = Some(Arc::new(f));
    self
  }

  /// Human-readable name used in notifications, e.g. "complete trip".
  pub fn label(mut self, label: impl Into<String>) -> Self {
    self.label = label.into();
    self
  }

  pub fn collection(&self) -> CollectionName {
    self.collection
  }

  pub fn op(&self) -> &MutationOp {
    &self.op
  }

  pub fn permission(&self) -> Permission {
    self.permission.clone().unwrap_or_else(|| {
      let action = match self.op {
        MutationOp::Create { .. } => Action::Create,
        MutationOp::Update { .. } => Action::Update,
        MutationOp::Delete { .. } => Action::Delete,
      };
      Permission::new(self.collection, action)
    })
  }

  fn projected(&self, record: Record) -> Record {
    match &self.project {
      Some(f) => f(record),
      None => record,
    }
  }

  fn event_for(&self, server: &Record) -> Option<MutationEvent> {
    match self.event.as_ref()? {
      Emits::Fixed(event) => Some(*event),
      Emits::FromServer(select) => Some(select(server)),
    }
  }

  fn reconciled(&self, record: Record) -> Record {
    match &self.reconcile {
      Some(f) => f(record),
      None => record,
    }
  }
}

impl fmt::Debug for MutationSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationSpec")
      .field("collection", &self.collection)
      .field("op", &self.op)
      .field("event", &self.event)
      .field("label", &self.label)
      .finish_non_exhaustive()
  }
}

/// Outcome of a successful mutation.
#[derive(Debug, Clone)]
pub struct MutationReceipt {
  /// The reconciled server record as it now sits in the store
  pub record: Arc<Record>,
  /// Collections refreshed by invalidation rules
  pub refreshed: Vec<CollectionName>,
  /// Set when the dependent refresh failed. The mutation itself still succeeded.
  pub invalidation_error: Option<CacheError>,
}

/// Handle to a mutation whose server call is in flight.
///
/// Dropping the handle does not cancel the mutation: it still reconciles or
/// rolls back, notifies and invalidates.
#[derive(Debug)]
pub struct PendingMutation {
  id: MutationId,
  placeholder: Option<RecordId>,
  state: watch::Receiver<MutationState>,
  task: JoinHandle<Result<MutationReceipt, CacheError>>,
}

impl PendingMutation {
  pub fn id(&self) -> MutationId {
    self.id
  }

  /// Placeholder id of the optimistic record, for creates.
  pub fn placeholder_id(&self) -> Option<&RecordId> {
    self.placeholder.as_ref()
  }

  pub fn state(&self) -> MutationState {
    *self.state.borrow()
  }

  /// Watch state transitions.
  pub fn subscribe(&self) -> watch::Receiver<MutationState> {
    self.state.clone()
  }

  /// Wait for the server's answer and everything that follows it.
  pub async fn settled(self) -> Result<MutationReceipt, CacheError> {
    self
      .task
      .await
      .map_err(|e| CacheError::TaskFailed(e.to_string()))?
  }
}

/// Runs optimistic mutations against a [`CacheManager`].
#[derive(Clone)]
pub struct MutationCoordinator {
  cache: CacheManager,
  permissions: Arc<dyn PermissionOracle>,
  notifier: Arc<dyn NotificationSink>,
  rules: InvalidationRules,
}

impl MutationCoordinator {
  pub fn new(
    cache: CacheManager,
    permissions: Arc<dyn PermissionOracle>,
    notifier: Arc<dyn NotificationSink>,
  ) -> Self {
    Self {
      cache,
      permissions,
      notifier,
      rules: InvalidationRules::default(),
    }
  }

  pub fn with_rules(mut self, rules: InvalidationRules) -> Self {
    self.rules = rules;
    self
  }

  pub fn cache(&self) -> &CacheManager {
    &self.cache
  }

  /// Check permission, apply the optimistic change and submit to the server.
  ///
  /// The optimistic change is visible in the cache when this returns. The
  /// server call and its settlement run on a spawned task, so this must be
  /// called from within a Tokio runtime.
  pub fn execute(&self, spec: MutationSpec) -> Result<PendingMutation, CacheError> {
    let permission = spec.permission();
    if !self.permissions.allows(&permission) {
      warn!(%permission, label = %spec.label, "mutation denied");
      self.notifier.notify(
        NotificationKind::Error,
        format!("Not allowed to {}", spec.label),
      );
      return Err(CacheError::PermissionDenied(permission));
    }

    let (id, snapshot) = self.cache.with_store(|store| begin(store, &spec))?;
    let placeholder = match &snapshot.touched {
      Touched::Created { placeholder } => Some(placeholder.clone()),
      _ => None,
    };
    debug!(mutation = %id, label = %spec.label, "optimistic change applied");

    let request = self
      .cache
      .remote()
      .submit_mutation(spec.collection, spec.op.clone());
    let (state, receiver) = watch::channel(MutationState::Pending);
    let settlement = Settlement {
      cache: self.cache.clone(),
      notifier: Arc::clone(&self.notifier),
      rules: self.rules,
      id,
      spec,
      snapshot,
      state,
    };
    let task = tokio::spawn(settlement.run(request));

    Ok(PendingMutation {
      id,
      placeholder,
      state: receiver,
      task,
    })
  }
}

/// Snapshot the collection, apply the optimistic change and record its overlay.
fn begin(store: &mut EntityStore, spec: &MutationSpec) -> (MutationId, Snapshot) {
  let id = store.next_mutation_id();
  let previous = store.get(spec.collection);
  let base = store.authoritative(spec.collection);

  let (kind, touched) = match &spec.op {
    MutationOp::Create { payload } => {
      let placeholder = RecordId::placeholder(id.0);
      let record = spec.projected(payload.clone()).with_id(&placeholder);
      (
        OverlayKind::Insert(Arc::new(record)),
        Touched::Created { placeholder },
      )
    }
    MutationOp::Update { id: target, patch } => (
      OverlayKind::Patch {
        id: target.clone(),
        patch: spec.projected(patch.clone()),
      },
      Touched::Updated { id: target.clone() },
    ),
    MutationOp::Delete { id: target } => (
      OverlayKind::Remove(target.clone()),
      Touched::Deleted { id: target.clone() },
    ),
  };

  let mut records = previous.records().to_vec();
  kind.apply(&mut records);
  store.replace_records(spec.collection, records);
  store.push_overlay(
    spec.collection,
    Overlay {
      mutation: id,
      kind,
    },
  );

  (
    id,
    Snapshot {
      previous,
      base,
      touched,
    },
  )
}

/// Swap the optimistic record for the server's and drop this mutation's overlay.
fn reconcile_records(
  store: &mut EntityStore,
  collection: CollectionName,
  mutation: MutationId,
  touched: &Touched,
  server: Arc<Record>,
) {
  store.remove_overlay(collection, mutation);
  let mut records = store.get(collection).records().to_vec();

  match touched {
    Touched::Created { placeholder } => {
      let slot = position(&records, placeholder);
      match server.id() {
        Some(server_id) => match (slot, position(&records, &server_id)) {
          // A fetch already brought the server's copy in: keep one entry
          (Some(slot), Some(existing)) => {
            records[existing] = Arc::clone(&server);
            records.remove(slot);
          }
          (Some(slot), None) => records[slot] = Arc::clone(&server),
          (None, Some(existing)) => records[existing] = Arc::clone(&server),
          (None, None) => records.insert(0, Arc::clone(&server)),
        },
        None => {
          warn!(%placeholder, "server record has no id, dropping optimistic record");
          if let Some(slot) = slot {
            records.remove(slot);
          }
        }
      }
    }
    Touched::Updated { id } => {
      if let Some(pos) = position(&records, id) {
        records[pos] = Arc::clone(&server);
      }
    }
    Touched::Deleted { id } => records.retain(|r| r.id().as_ref() != Some(id)),
  }

  // Other pending mutations on the same records go back on top
  let records = reapply(records, store.overlays(collection));
  store.replace_records(collection, records);
}

/// Undo this mutation's change only, restoring the touched record from the
/// snapshot or from a fetch that landed while the mutation was pending.
fn rollback_records(
  store: &mut EntityStore,
  collection: CollectionName,
  mutation: MutationId,
  snapshot: &Snapshot,
) {
  store.remove_overlay(collection, mutation);
  let source = snapshot.restore_source(store.authoritative(collection));
  let mut records = store.get(collection).records().to_vec();

  match &snapshot.touched {
    Touched::Created { placeholder } => {
      records.retain(|r| r.id().as_ref() != Some(placeholder));
    }
    Touched::Updated { id } => {
      if let (Some(pos), Some(before)) = (position(&records, id), source.get(id)) {
        records[pos] = Arc::clone(before);
      }
    }
    Touched::Deleted { id } => {
      let removed_elsewhere = store.overlays(collection).iter().any(
        |o| matches!(&o.kind, OverlayKind::Remove(other) if other == id),
      );
      let present = position(&records, id).is_some();
      if let (false, false, Some(before)) = (removed_elsewhere, present, source.get(id)) {
        let at = restore_position(&records, &source, id);
        records.insert(at, Arc::clone(before));
      }
    }
  }

  let records = reapply(records, store.overlays(collection));
  store.replace_records(collection, records);
}

/// Where to reinsert `id`: after its nearest surviving predecessor from the
/// snapshot, else before its nearest surviving successor, else at its old index.
fn restore_position(current: &[Arc<Record>], previous: &Collection, id: &RecordId) -> usize {
  let Some(index) = previous.position(id) else {
    return 0;
  };
  let before = previous.records()[..index].iter().rev();
  for record in before {
    if let Some(pos) = record.id().and_then(|rid| position(current, &rid)) {
      return pos + 1;
    }
  }
  let after = previous.records()[index + 1..].iter();
  for record in after {
    if let Some(pos) = record.id().and_then(|rid| position(current, &rid)) {
      return pos;
    }
  }
  index.min(current.len())
}

/// Drives one mutation from server response to its final state.
struct Settlement {
  cache: CacheManager,
  notifier: Arc<dyn NotificationSink>,
  rules: InvalidationRules,
  id: MutationId,
  spec: MutationSpec,
  snapshot: Snapshot,
  state: watch::Sender<MutationState>,
}

impl Settlement {
  async fn run(self, request: BoxFuture<Record>) -> Result<MutationReceipt, CacheError> {
    match request.await {
      Ok(server) => self.succeed(server).await,
      Err(source) => Err(self.roll_back(source)),
    }
  }

  async fn succeed(self, server: Record) -> Result<MutationReceipt, CacheError> {
    let collection = self.spec.collection;
    let record = Arc::new(self.spec.reconciled(server));
    self.cache.with_store(|store| {
      reconcile_records(
        store,
        collection,
        self.id,
        &self.snapshot.touched,
        Arc::clone(&record),
      )
    })?;
    self.state.send_replace(MutationState::Succeeded);
    info!(mutation = %self.id, label = %self.spec.label, id = ?record.id(), "mutation succeeded");
    self.notifier.notify(
      NotificationKind::Success,
      format!("{} succeeded", capitalize(&self.spec.label)),
    );

    let mut receipt = MutationReceipt {
      record,
      refreshed: Vec::new(),
      invalidation_error: None,
    };
    if let Some(event) = self.spec.event_for(&receipt.record) {
      match self.rules.apply(&self.cache, event).await {
        Ok(names) => receipt.refreshed = names.to_vec(),
        Err(e) => {
          warn!(mutation = %self.id, %event, error = %e, "dependent refresh failed");
          receipt.invalidation_error = Some(e);
        }
      }
    }
    Ok(receipt)
  }

  fn roll_back(self, source: RemoteError) -> CacheError {
    let collection = self.spec.collection;
    warn!(mutation = %self.id, label = %self.spec.label, error = %source, "mutation rejected, rolling back");

    if let Err(e) = self
      .cache
      .with_store(|store| rollback_records(store, collection, self.id, &self.snapshot))
    {
      error!(mutation = %self.id, error = %e, "rollback failed");
    }
    self.state.send_replace(MutationState::RolledBack);
    self.notifier.notify(
      NotificationKind::Error,
      format!("Failed to {}: {}", self.spec.label, source),
    );

    CacheError::MutationRejected {
      collection,
      op: self.spec.op.verb(),
      source,
    }
  }
}

fn capitalize(s: &str) -> String {
  let mut chars = s.chars();
  match chars.next() {
    Some(first) => first.to_uppercase().chain(chars).collect(),
    None => String::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::notify::ChannelNotifier;
  use crate::permissions::{AllowAll, RolePermissions};
  use crate::remote::InMemoryRemote;
  use serde_json::json;

  struct Fixture {
    remote: Arc<InMemoryRemote>,
    cache: CacheManager,
    coordinator: MutationCoordinator,
    notifications: tokio::sync::mpsc::UnboundedReceiver<crate::notify::Notification>,
  }

  async fn fixture(permissions: Arc<dyn PermissionOracle>) -> Fixture {
    let remote = Arc::new(InMemoryRemote::new());
    remote.seed(
      CollectionName::Trips,
      vec![
        json!({"id": "t1", "status": "completed", "van_id": "v1"}),
        json!({"id": "t2", "status": "active", "van_id": "v2"}),
        json!({"id": "t3", "status": "active", "van_id": "v3"}),
      ],
    );
    let cache = CacheManager::new(remote.clone());
    cache.get(CollectionName::Trips).await.unwrap();
    let (notifier, notifications) = ChannelNotifier::new();
    let coordinator = MutationCoordinator::new(cache.clone(), permissions, Arc::new(notifier));
    Fixture {
      remote,
      cache,
      coordinator,
      notifications,
    }
  }

  fn trip_ids(cache: &CacheManager) -> Vec<String> {
    cache
      .peek(CollectionName::Trips)
      .unwrap()
      .ids()
      .map(|id| id.to_string())
      .collect()
  }

  #[tokio::test]
  async fn test_permission_denied_leaves_store_untouched() {
    let oracle = RolePermissions::from_grants([Permission::new(CollectionName::Trips, Action::Read)]);
    let mut fx = fixture(Arc::new(oracle)).await;
    let before = fx.cache.peek(CollectionName::Trips).unwrap();

    let err = fx
      .coordinator
      .execute(MutationSpec::delete(CollectionName::Trips, "t1".into()))
      .unwrap_err();

    assert!(matches!(err, CacheError::PermissionDenied(_)));
    assert!(Arc::ptr_eq(&before, &fx.cache.peek(CollectionName::Trips).unwrap()));
    assert_eq!(fx.notifications.recv().await.unwrap().kind, NotificationKind::Error);
    assert_eq!(fx.remote.rows(CollectionName::Trips).len(), 3);
  }

  #[tokio::test]
  async fn test_create_shows_placeholder_then_server_record_in_place() {
    let mut fx = fixture(Arc::new(AllowAll)).await;
    fx.remote.hold_mutations_for("trips");

    let pending = fx
      .coordinator
      .execute(MutationSpec::create(
        CollectionName::Trips,
        Record::new().with("van_id", "v9"),
      ))
      .unwrap();
    let placeholder = pending.placeholder_id().cloned().unwrap();
    assert!(placeholder.is_placeholder());
    assert_eq!(pending.state(), MutationState::Pending);
    assert_eq!(trip_ids(&fx.cache)[0], placeholder.to_string());

    fx.remote.release_mutations_for("trips");
    let receipt = pending.settled().await.unwrap();

    let server_id = receipt.record.id().unwrap();
    let ids = trip_ids(&fx.cache);
    assert_eq!(ids.len(), 4);
    assert_eq!(ids[0], server_id.to_string());
    assert!(!ids.iter().any(|id| id.starts_with("optimistic-")));
    assert_eq!(fx.notifications.recv().await.unwrap().kind, NotificationKind::Success);
  }

  #[test]
  fn test_create_does_not_duplicate_when_fetch_lands_first() {
    let mut store = EntityStore::default();
    let rec = |v: serde_json::Value| Arc::new(Record::from_value(v).unwrap());
    store.commit(CollectionName::Trips, 1, vec![rec(json!({"id": "t1"}))], chrono::Utc::now());

    let create = MutationSpec::create(CollectionName::Trips, Record::new().with("van_id", "v9"));
    let (id, snapshot) = begin(&mut store, &create);

    // A fetch commits with the server's copy while the placeholder is still shown
    let fetched = vec![rec(json!({"id": "t1"})), rec(json!({"id": "t9", "van_id": "v9"}))];
    let records = reapply(fetched, store.overlays(CollectionName::Trips));
    store.commit(CollectionName::Trips, 2, records, chrono::Utc::now());
    assert_eq!(store.get(CollectionName::Trips).len(), 3);

    let server = rec(json!({"id": "t9", "van_id": "v9", "status": "active"}));
    reconcile_records(&mut store, CollectionName::Trips, id, &snapshot.touched, Arc::clone(&server));

    let after = store.get(CollectionName::Trips);
    let ids: Vec<_> = after.ids().map(|id| id.to_string()).collect();
    assert_eq!(ids, vec!["t1", "t9"]);
    assert!(Arc::ptr_eq(&after.records()[1], &server));
  }

  #[tokio::test]
  async fn test_failed_update_restores_snapshot() {
    let mut fx = fixture(Arc::new(AllowAll)).await;
    let before = fx.cache.peek(CollectionName::Trips).unwrap();
    fx.remote.reject_mutations_for("t2");

    let pending = fx
      .coordinator
      .execute(MutationSpec::update(
        CollectionName::Trips,
        "t2".into(),
        Record::new().with("status", "completed"),
      ))
      .unwrap();
    let optimistic = fx.cache.peek(CollectionName::Trips).unwrap();
    assert_eq!(optimistic.records()[1].get_str("status"), Some("completed"));

    let err = pending.settled().await.unwrap_err();
    assert!(matches!(err, CacheError::MutationRejected { op: "update", .. }));

    let after = fx.cache.peek(CollectionName::Trips).unwrap();
    assert_eq!(after.records(), before.records());
    assert!(Arc::ptr_eq(&after.records()[1], &before.records()[1]));
    assert_eq!(fx.notifications.recv().await.unwrap().kind, NotificationKind::Error);
  }

  #[tokio::test]
  async fn test_failed_delete_survives_concurrent_success() {
    let fx = fixture(Arc::new(AllowAll)).await;
    let before = fx.cache.peek(CollectionName::Trips).unwrap();
    fx.remote.hold_mutations_for("t2");
    fx.remote.reject_mutations_for("t2");

    let delete = fx
      .coordinator
      .execute(MutationSpec::delete(CollectionName::Trips, "t2".into()))
      .unwrap();
    assert_eq!(trip_ids(&fx.cache), vec!["t1", "t3"]);

    // An unrelated update succeeds while the delete is in flight
    let update = fx
      .coordinator
      .execute(MutationSpec::update(
        CollectionName::Trips,
        "t3".into(),
        Record::new().with("notes", "late"),
      ))
      .unwrap();
    update.settled().await.unwrap();

    fx.remote.release_mutations_for("t2");
    assert!(delete.settled().await.is_err());

    let after = fx.cache.peek(CollectionName::Trips).unwrap();
    let ids: Vec<_> = after.ids().map(|id| id.to_string()).collect();
    assert_eq!(ids, vec!["t1", "t2", "t3"]);
    assert!(Arc::ptr_eq(&after.records()[1], &before.records()[1]));
    assert_eq!(after.records()[2].get_str("notes"), Some("late"));
  }

  /// Trips live on the server but nothing is cached yet.
  fn cold_cache() -> (Arc<InMemoryRemote>, CacheManager, MutationCoordinator) {
    let remote = Arc::new(InMemoryRemote::new());
    remote.seed(
      CollectionName::Trips,
      vec![
        json!({"id": "t1", "status": "active", "van_id": "v1"}),
        json!({"id": "t2", "status": "active", "van_id": "v2"}),
      ],
    );
    let cache = CacheManager::new(remote.clone());
    let (notifier, _) = ChannelNotifier::new();
    let coordinator = MutationCoordinator::new(cache.clone(), Arc::new(AllowAll), Arc::new(notifier));
    (remote, cache, coordinator)
  }

  #[tokio::test]
  async fn test_failed_update_on_cold_cache_restores_fetched_record() {
    let (remote, cache, coordinator) = cold_cache();
    remote.hold_mutations_for("t2");
    remote.reject_mutations_for("t2");

    let pending = coordinator
      .execute(MutationSpec::update(
        CollectionName::Trips,
        "t2".into(),
        Record::new().with("status", "completed"),
      ))
      .unwrap();

    // The fetch lands under the pending patch
    let trips = cache.get(CollectionName::Trips).await.unwrap();
    assert_eq!(trips.get(&"t2".into()).unwrap().get_str("status"), Some("completed"));

    remote.release_mutations_for("t2");
    assert!(pending.settled().await.is_err());

    let after = cache.peek(CollectionName::Trips).unwrap();
    assert_eq!(after.len(), 2);
    assert_eq!(after.get(&"t2".into()).unwrap().get_str("status"), Some("active"));
    assert_eq!(cache.stats().unwrap().optimistic, 0);
  }

  #[tokio::test]
  async fn test_failed_delete_on_cold_cache_restores_fetched_record() {
    let (remote, cache, coordinator) = cold_cache();
    remote.hold_mutations_for("t2");
    remote.reject_mutations_for("t2");

    let pending = coordinator
      .execute(MutationSpec::delete(CollectionName::Trips, "t2".into()))
      .unwrap();
    cache.get(CollectionName::Trips).await.unwrap();
    assert_eq!(trip_ids(&cache), vec!["t1"]);

    remote.release_mutations_for("t2");
    assert!(pending.settled().await.is_err());

    assert_eq!(trip_ids(&cache), vec!["t1", "t2"]);
    let t2 = cache.peek(CollectionName::Trips).unwrap().get(&"t2".into()).cloned().unwrap();
    assert_eq!(t2.get_str("status"), Some("active"));
  }

  #[test]
  fn test_rollback_keeps_unrelated_success() {
    let mut store = EntityStore::default();
    let rec = |v: serde_json::Value| Arc::new(Record::from_value(v).unwrap());
    store.commit(
      CollectionName::Trips,
      1,
      vec![
        rec(json!({"id": "t1"})),
        rec(json!({"id": "t2"})),
        rec(json!({"id": "t3", "notes": ""})),
      ],
      chrono::Utc::now(),
    );
    let before = store.get(CollectionName::Trips);

    let delete = MutationSpec::delete(CollectionName::Trips, "t2".into());
    let (delete_id, delete_snapshot) = begin(&mut store, &delete);
    let update = MutationSpec::update(
      CollectionName::Trips,
      "t3".into(),
      Record::new().with("notes", "late"),
    );
    let (update_id, update_snapshot) = begin(&mut store, &update);

    let server = Arc::new(Record::from_value(json!({"id": "t3", "notes": "late"})).unwrap());
    reconcile_records(
      &mut store,
      CollectionName::Trips,
      update_id,
      &update_snapshot.touched,
      Arc::clone(&server),
    );
    rollback_records(&mut store, CollectionName::Trips, delete_id, &delete_snapshot);

    let after = store.get(CollectionName::Trips);
    let ids: Vec<_> = after.ids().map(|id| id.to_string()).collect();
    assert_eq!(ids, vec!["t1", "t2", "t3"]);
    assert!(Arc::ptr_eq(&after.records()[1], &before.records()[1]));
    assert!(Arc::ptr_eq(&after.records()[2], &server));
    assert!(store.overlays(CollectionName::Trips).is_empty());
  }

  #[test]
  fn test_rollback_of_update_reapplies_other_pending_patch() {
    let mut store = EntityStore::default();
    store.commit(
      CollectionName::Vans,
      1,
      vec![Arc::new(Record::new().with("id", "v1").with("status", "Active").with("km", 10))],
      chrono::Utc::now(),
    );

    let first = MutationSpec::update(CollectionName::Vans, "v1".into(), Record::new().with("status", "Maintenance"));
    let (first_id, first_snapshot) = begin(&mut store, &first);
    let second = MutationSpec::update(CollectionName::Vans, "v1".into(), Record::new().with("km", 20));
    begin(&mut store, &second);

    rollback_records(&mut store, CollectionName::Vans, first_id, &first_snapshot);

    let van = Arc::clone(&store.get(CollectionName::Vans).records()[0]);
    assert_eq!(van.get_str("status"), Some("Active"));
    assert_eq!(van.get("km"), Some(&json!(20)));
  }

  #[test]
  fn test_restore_position_anchors_to_surviving_neighbour() {
    let rec = |id: &str| Arc::new(Record::new().with("id", id));
    let previous = Collection::fetched(
      CollectionName::Trips,
      vec![rec("a"), rec("b"), rec("c"), rec("d")],
      chrono::Utc::now(),
    );

    // Predecessor "b" survives
    assert_eq!(restore_position(&[rec("x"), rec("a"), rec("b"), rec("d")], &previous, &"c".into()), 3);
    // Predecessors gone, successor "d" survives
    assert_eq!(restore_position(&[rec("x"), rec("d")], &previous, &"c".into()), 1);
    // Nothing survives
    assert_eq!(restore_position(&[rec("x")], &previous, &"c".into()), 1);
  }

  #[tokio::test]
  async fn test_dropped_handle_still_settles() {
    let mut fx = fixture(Arc::new(AllowAll)).await;
    fx.remote.reject_mutations_for("t1");

    let pending = fx
      .coordinator
      .execute(MutationSpec::delete(CollectionName::Trips, "t1".into()))
      .unwrap();
    drop(pending);

    // Settlement notifies once it has rolled back
    let notification = fx.notifications.recv().await.unwrap();
    assert_eq!(notification.kind, NotificationKind::Error);
    assert_eq!(trip_ids(&fx.cache), vec!["t1", "t2", "t3"]);
    assert_eq!(fx.cache.stats().unwrap().optimistic, 0);
  }

  #[tokio::test]
  async fn test_pending_overlay_survives_refresh() {
    let fx = fixture(Arc::new(AllowAll)).await;
    fx.remote.hold_mutations_for("t2");

    let pending = fx
      .coordinator
      .execute(MutationSpec::delete(CollectionName::Trips, "t2".into()))
      .unwrap();
    fx.cache.refresh(&[CollectionName::Trips]).await.unwrap();

    assert_eq!(trip_ids(&fx.cache), vec!["t1", "t3"]);
    assert_eq!(fx.cache.stats().unwrap().optimistic, 1);

    fx.remote.release_mutations_for("t2");
    pending.settled().await.unwrap();
    assert_eq!(trip_ids(&fx.cache), vec!["t1", "t3"]);
    assert_eq!(fx.cache.stats().unwrap().optimistic, 0);
  }
}

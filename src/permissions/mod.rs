//! Permission checks consumed by the mutation coordinator.

mod migration;

pub use migration::{migrate, version_of, MigrationError, PermissionDocument, CURRENT_VERSION};

use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::cache::{CollectionName, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
  Read,
  Create,
  Update,
  Delete,
}

impl Action {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Read => "read",
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }
}

impl FromStr for Action {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "read" | "view" => Ok(Self::Read),
      "create" => Ok(Self::Create),
      "update" | "edit" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      other => Err(format!("unknown action: {other}")),
    }
  }
}

/// `resource.action`, e.g. `trips.create`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Permission {
  pub resource: CollectionName,
  pub action: Action,
}

impl Permission {
  pub fn new(resource: CollectionName, action: Action) -> Self {
    Self { resource, action }
  }
}

impl fmt::Display for Permission {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.resource, self.action.as_str())
  }
}

/// Answers whether the current user may perform an action.
pub trait PermissionOracle: Send + Sync {
  fn allows(&self, permission: &Permission) -> bool;
}

/// Grants everything. For tools and tests that run without a session.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PermissionOracle for AllowAll {
  fn allows(&self, _permission: &Permission) -> bool {
    true
  }
}

/// Permissions granted to a user group.
#[derive(Debug, Clone, Default)]
pub struct RolePermissions {
  grants: HashSet<Permission>,
}

impl RolePermissions {
  pub fn from_grants(grants: impl IntoIterator<Item = Permission>) -> Self {
    Self {
      grants: grants.into_iter().collect(),
    }
  }

  /// Build from a raw permission document of any supported version.
  /// Unknown resources and actions are ignored.
  pub fn from_document(doc: Value) -> Result<Self, MigrationError> {
    let doc = migrate(doc)?;
    let mut grants = HashSet::new();
    for (resource, actions) in &doc.grants {
      let Ok(resource) = resource.parse::<CollectionName>() else {
        tracing::debug!(%resource, "ignoring grant on unknown resource");
        continue;
      };
      for action in actions {
        match action.parse::<Action>() {
          Ok(action) => {
            grants.insert(Permission::new(resource, action));
          }
          Err(e) => tracing::debug!(error = %e, "ignoring grant"),
        }
      }
    }
    Ok(Self { grants })
  }

  /// Build from a `user_groups` record's `permissions` field.
  pub fn from_group_record(group: &Record) -> Result<Self, MigrationError> {
    Self::from_document(group.get("permissions").cloned().unwrap_or(Value::Null))
  }

  pub fn len(&self) -> usize {
    self.grants.len()
  }

  pub fn is_empty(&self) -> bool {
    self.grants.is_empty()
  }
}

impl PermissionOracle for RolePermissions {
  fn allows(&self, permission: &Permission) -> bool {
    self.grants.contains(permission)
  }
}

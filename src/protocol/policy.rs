//! # Exposure Policy
//!
//! Authorization check run on the owning side before every incoming request
//! is applied. The client never evaluates it: it cannot know the server's
//! policy and must be prepared for any operation to be refused.
//!
//! ## Modes
//! - **Unrestricted**: everything is allowed
//! - **Public**: names with a leading underscore are refused
//! - **Restricted**: named operations must appear on the object's
//!   [`attribute_names`](crate::protocol::object::RemoteObject::attribute_names)
//!   or on the configured allow-list; private names are refused
//!
//! Attribute writes and deletes, and by-value snapshots, are additionally
//! gated by their own switches in [`AccessConfig`].
//!
//! A deployment can replace the whole check with any type implementing
//! [`ExposurePolicy`], including a plain closure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::AccessConfig;
use crate::protocol::object::{CallContext, Data, ObjectRef, RemoteError, RemoteObject};
use crate::protocol::value::TypeInfo;

/// Operation being checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation<'a> {
    GetAttr(&'a str),
    SetAttr(&'a str),
    DelAttr(&'a str),
    CallAttr(&'a str),
    Call,
    GetItem,
    SetItem,
    DelItem,
    Len,
    Repr,
    Str,
    Compare,
    Dir,
    Snapshot,
    Iterate,
}

impl<'a> Operation<'a> {
    /// Attribute name for named operations, protocol name otherwise
    pub fn name(&self) -> &'a str {
        match self {
            Operation::GetAttr(name)
            | Operation::SetAttr(name)
            | Operation::DelAttr(name)
            | Operation::CallAttr(name) => name,
            Operation::Call => "__call__",
            Operation::GetItem => "__getitem__",
            Operation::SetItem => "__setitem__",
            Operation::DelItem => "__delitem__",
            Operation::Len => "__len__",
            Operation::Repr => "__repr__",
            Operation::Str => "__str__",
            Operation::Compare => "__cmp__",
            Operation::Dir => "__dir__",
            Operation::Snapshot => "__snapshot__",
            Operation::Iterate => "__next__",
        }
    }

    /// True for operations addressing an attribute by name
    pub fn is_named(&self) -> bool {
        matches!(
            self,
            Operation::GetAttr(_)
                | Operation::SetAttr(_)
                | Operation::DelAttr(_)
                | Operation::CallAttr(_)
        )
    }
}

pub trait ExposurePolicy: Send + Sync + 'static {
    fn is_allowed(&self, object: &dyn RemoteObject, operation: &Operation<'_>) -> bool;
}

impl<F> ExposurePolicy for F
where
    F: Fn(&dyn RemoteObject, &Operation<'_>) -> bool + Send + Sync + 'static,
{
    fn is_allowed(&self, object: &dyn RemoteObject, operation: &Operation<'_>) -> bool {
        self(object, operation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Unrestricted,
    #[default]
    Public,
    Restricted,
}

/// Policy built from [`AccessConfig`]
#[derive(Debug, Clone)]
pub struct DefaultPolicy {
    mode: AccessMode,
    allow_setattr: bool,
    allow_delattr: bool,
    allow_snapshot: bool,
    allowed_names: HashSet<String>,
}

impl DefaultPolicy {
    pub fn from_config(config: &AccessConfig) -> Self {
        Self {
            mode: config.mode,
            allow_setattr: config.allow_setattr,
            allow_delattr: config.allow_delattr,
            allow_snapshot: config.allow_snapshot,
            allowed_names: config.allowed_names.iter().cloned().collect(),
        }
    }

    /// Policy that allows every operation
    pub fn unrestricted() -> Self {
        Self {
            mode: AccessMode::Unrestricted,
            allow_setattr: true,
            allow_delattr: true,
            allow_snapshot: true,
            allowed_names: HashSet::new(),
        }
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self::from_config(&AccessConfig::default())
    }
}

impl ExposurePolicy for DefaultPolicy {
    fn is_allowed(&self, object: &dyn RemoteObject, operation: &Operation<'_>) -> bool {
        if self.mode == AccessMode::Unrestricted {
            return true;
        }

        match operation {
            Operation::SetAttr(_) if !self.allow_setattr => return false,
            Operation::DelAttr(_) if !self.allow_delattr => return false,
            Operation::Snapshot => return self.allow_snapshot,
            _ => {}
        }

        if !operation.is_named() {
            return true;
        }

        let name = operation.name();
        if name.starts_with('_') {
            return false;
        }

        match self.mode {
            AccessMode::Restricted => {
                self.allowed_names.contains(name)
                    || object.attribute_names().iter().any(|n| n == name)
            }
            _ => true,
        }
    }
}

/// Restricted view of an object: only the listed attributes can be read (and
/// called), and only the writable set can be assigned.
pub struct Restricted {
    inner: ObjectRef,
    readable: HashSet<String>,
    writable: HashSet<String>,
}

impl Restricted {
    /// Same set for reading and writing
    pub fn new<I, S>(inner: ObjectRef, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let readable: HashSet<String> = attrs.into_iter().map(Into::into).collect();
        Self {
            inner,
            writable: readable.clone(),
            readable,
        }
    }

    /// Replace the writable set; pass an empty iterator to forbid writes
    pub fn with_writable<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.writable = attrs.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl RemoteObject for Restricted {
    fn type_info(&self) -> TypeInfo {
        self.inner.type_info()
    }

    fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.readable.iter().cloned().collect();
        names.sort();
        names
    }

    async fn getattr(&self, ctx: &CallContext, name: &str) -> Result<Data, RemoteError> {
        if !self.readable.contains(name) {
            return Err(RemoteError::attribute(&self.type_info(), name));
        }
        self.inner.getattr(ctx, name).await
    }

    async fn setattr(&self, ctx: &CallContext, name: &str, value: Data) -> Result<(), RemoteError> {
        if !self.writable.contains(name) {
            return Err(RemoteError::attribute(&self.type_info(), name));
        }
        self.inner.setattr(ctx, name, value).await
    }

    async fn call_method(
        &self,
        ctx: &CallContext,
        name: &str,
        args: Vec<Data>,
        kwargs: Vec<(String, Data)>,
    ) -> Result<Data, RemoteError> {
        if !self.readable.contains(name) {
            return Err(RemoteError::attribute(&self.type_info(), name));
        }
        self.inner.call_method(ctx, name, args, kwargs).await
    }

    fn repr(&self) -> String {
        self.inner.repr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessConfig;

    struct Service;

    #[async_trait]
    impl RemoteObject for Service {
        fn attribute_names(&self) -> Vec<String> {
            vec!["status".into()]
        }
    }

    fn policy(mode: AccessMode) -> DefaultPolicy {
        DefaultPolicy::from_config(&AccessConfig {
            mode,
            allowed_names: vec!["version".into()],
            ..AccessConfig::default()
        })
    }

    #[test]
    fn test_public_mode_denies_private_names() {
        let p = policy(AccessMode::Public);
        assert!(p.is_allowed(&Service, &Operation::GetAttr("anything")));
        assert!(!p.is_allowed(&Service, &Operation::GetAttr("_secret")));
        assert!(!p.is_allowed(&Service, &Operation::CallAttr("__init__")));
        assert!(p.is_allowed(&Service, &Operation::Call));
    }

    #[test]
    fn test_restricted_mode_uses_allow_lists() {
        let p = policy(AccessMode::Restricted);
        assert!(p.is_allowed(&Service, &Operation::GetAttr("status")));
        assert!(p.is_allowed(&Service, &Operation::GetAttr("version")));
        assert!(!p.is_allowed(&Service, &Operation::CallAttr("delete_everything")));
        assert!(p.is_allowed(&Service, &Operation::Repr));
    }

    #[test]
    fn test_write_switches() {
        let p = policy(AccessMode::Public);
        assert!(!p.is_allowed(&Service, &Operation::SetAttr("status")));
        assert!(!p.is_allowed(&Service, &Operation::DelAttr("status")));
        assert!(!p.is_allowed(&Service, &Operation::Snapshot));

        let open = DefaultPolicy::from_config(&AccessConfig {
            allow_setattr: true,
            allow_snapshot: true,
            ..AccessConfig::default()
        });
        assert!(open.is_allowed(&Service, &Operation::SetAttr("status")));
        assert!(open.is_allowed(&Service, &Operation::Snapshot));
    }

    #[test]
    fn test_unrestricted_allows_everything() {
        let p = DefaultPolicy::unrestricted();
        assert!(p.is_allowed(&Service, &Operation::DelAttr("_private")));
    }

    #[test]
    fn test_closure_policy() {
        let deny_all = |_: &dyn RemoteObject, _: &Operation<'_>| false;
        assert!(!deny_all.is_allowed(&Service, &Operation::Repr));
    }
}

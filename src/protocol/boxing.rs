//! Rule deciding whether a live object crosses the wire by value or by
//! reference.
//!
//! The default [`ReferenceAll`] boxes every object into a reference marker.
//! [`ValueTypes`] sends the listed types by value using their
//! [`snapshot`](crate::protocol::object::RemoteObject::snapshot).

use std::collections::HashSet;

use crate::protocol::object::RemoteObject;

pub trait BoxingPolicy: Send + Sync + 'static {
    /// True when `object` should travel as its snapshot
    fn by_value(&self, object: &dyn RemoteObject) -> bool;
}

/// Every live object travels by reference
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceAll;

impl BoxingPolicy for ReferenceAll {
    fn by_value(&self, _object: &dyn RemoteObject) -> bool {
        false
    }
}

/// Objects whose type name is listed travel by value
#[derive(Debug, Clone, Default)]
pub struct ValueTypes {
    names: HashSet<String>,
}

impl ValueTypes {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl BoxingPolicy for ValueTypes {
    fn by_value(&self, object: &dyn RemoteObject) -> bool {
        self.names.contains(&object.type_info().name)
    }
}

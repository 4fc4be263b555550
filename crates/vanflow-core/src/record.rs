//! The [`Record`] trait and the attributes shared by every record type.

use crate::codec::fields::{FieldSet, Fields};
use crate::codec::time::Time;
use crate::codec::value::IDENTITY;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// Codepoint of [`BaseRecord::start_time`].
pub const START_TIME: u32 = 3;

/// Codepoint of [`BaseRecord::end_time`].
pub const END_TIME: u32 = 4;

/// A typed snapshot of domain state, identified by a string ID.
///
/// Records are immutable once published: a change is represented by a new
/// snapshot. Types are registered with a [`Registry`](crate::Registry) before
/// they can be encoded.
pub trait Record: Any + Debug + Send + Sync {
    /// The record identity.
    fn identity(&self) -> &str;

    /// Short type name, used in logs and error messages.
    fn record_name(&self) -> &'static str;

    /// Upcast for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a decoded or published record.
pub type RecordRef = Arc<dyn Record>;

impl dyn Record {
    /// Borrow the record as its concrete type.
    #[must_use]
    pub fn downcast_ref<T: Record>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Whether the record is of concrete type `T`.
    #[must_use]
    pub fn is<T: Record>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Identity and lifetime attributes embedded in every record type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseRecord {
    /// Record identity (codepoint 1, required).
    pub id: String,
    /// When the recorded entity came into existence.
    pub start_time: Time,
    /// When the recorded entity ceased to exist.
    pub end_time: Time,
}

impl BaseRecord {
    /// Create a base record with no start or end time.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

impl Fields for BaseRecord {
    fn fields() -> FieldSet<Self> {
        FieldSet::<Self>::new()
            .required("id", IDENTITY, |r| &r.id, |r| &mut r.id)
            .field("start_time", START_TIME, |r| &r.start_time, |r| &mut r.start_time)
            .field("end_time", END_TIME, |r| &r.end_time, |r| &mut r.end_time)
    }
}

/// Declare a record type embedding [`BaseRecord`].
///
/// Every listed attribute becomes an `Option` field tagged with its
/// codepoint. The macro implements [`Record`] and [`Fields`] for the type;
/// register it with [`Registry::register`](crate::Registry::register) before
/// use.
///
/// ```
/// vanflow_core::record! {
///     /// A thing with a colour.
///     pub struct WidgetRecord {
///         colour: String => 9001,
///         size: u64 => 9002,
///     }
/// }
///
/// let widget = WidgetRecord::new("w-1");
/// assert_eq!(widget.base.id, "w-1");
/// assert!(widget.colour.is_none());
/// ```
#[macro_export]
macro_rules! record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty => $cp:literal ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        $vis struct $name {
            /// Identity and lifetime attributes.
            pub base: $crate::BaseRecord,
            $(
                $(#[$fmeta])*
                #[doc = concat!("Codepoint ", stringify!($cp), ".")]
                pub $field: ::core::option::Option<$ty>,
            )*
        }

        impl $name {
            /// Create a record with the given identity and no other attributes.
            #[must_use]
            #[allow(clippy::needless_update)]
            pub fn new(id: impl Into<::std::string::String>) -> Self {
                Self {
                    base: $crate::BaseRecord::new(id),
                    ..Self::default()
                }
            }
        }

        impl $crate::Fields for $name {
            fn fields() -> $crate::FieldSet<Self> {
                $crate::FieldSet::<Self>::new()
                    .embed(|r| &r.base, |r| &mut r.base)
                    $( .field(stringify!($field), $cp, |r| &r.$field, |r| &mut r.$field) )*
            }
        }

        impl $crate::Record for $name {
            fn identity(&self) -> &str {
                &self.base.id
            }

            fn record_name(&self) -> &'static str {
                stringify!($name)
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }
        }
    };
}

//! Typed events and their canonical channel names.
//!
//! An event is any user-defined record with a stable name. The name is the
//! fully qualified identifier of the record's type and doubles as the
//! publish/subscribe channel. Because the codec never embeds a type in the
//! payload, recipients must know the target type statically; that is
//! exactly what the [`Event`] bound on subscription provides.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A record that can travel over the bus.
///
/// `CHANNEL` is the canonical name of the type (module path plus type name)
/// and routes every publish of this type. Implement the trait with the
/// [`event!`](crate::event!) macro, which derives the name, or by hand when
/// the channel must stay stable across a type rename:
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use wirebus::event;
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Ping {
///     seq: u64,
/// }
/// event!(Ping);
/// ```
pub trait Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Canonical name of this event type; doubles as its channel
    const CHANNEL: &'static str;
}

/// Register an event type under its canonical `module::path::Name` channel
#[macro_export]
macro_rules! event {
    ($ty:ident) => {
        impl $crate::Event for $ty {
            const CHANNEL: &'static str = concat!(module_path!(), "::", stringify!($ty));
        }
    };
    ($ty:ident, $channel:expr) => {
        impl $crate::Event for $ty {
            const CHANNEL: &'static str = $channel;
        }
    };
}

//! Progress streaming: ordered multi-subscriber fan-out of
//! [`crate::domain::ProgressEvent`]s.

pub mod bus;

pub use bus::{ProgressBus, ProgressSubscription};

//! Pure scheduling calculators.
//!
//! Nothing in this module performs I/O: the recurrence calculator and the
//! reminder resolver are deterministic functions over task data and a
//! reference instant, safe to call repeatedly with the same inputs. The
//! coordinator owns all storage and delivery side effects.

pub mod recurrence;
pub mod reminder;

pub use recurrence::{advance_pair, next_occurrence, nth_following};
pub use reminder::{resolve, ReminderDisposition, ReminderPayload};

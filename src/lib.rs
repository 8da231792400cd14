//! Tracks the validity of a value against a set of possibly asynchronous constraints.
//!
//! A [`ConstrainedValue`] runs its [`Constraint`]s whenever the value or a dependency of a constraint changes,
//! and keeps its flags, its [`DiagnosticList`] and its constrained value consistent with the latest result
//! of each constraint.

pub mod core;
mod constrained;
mod constraint;
mod deferred;
mod diagnostics;
mod helper;
mod result;
mod state;
mod subscription;
mod utils;
mod validator;

pub use constrained::*;
pub use constraint::*;
pub use crate::core::Runtime;
pub use diagnostics::*;
pub use helper::{ChangeKind, Flag};
pub use result::*;
pub use state::*;
pub use subscription::*;
pub use validator::{ValidatorEvent, ValidatorState};

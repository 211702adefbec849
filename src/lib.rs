//! remotestep - drive a real server process from tests
//!
//! This library launches the application under test as an independent child
//! process, ships named "steps" into it through an on-disk protocol, executes
//! each step against the live application, and reports success or a faithfully
//! reconstructed failure back to the calling test.

pub mod common;
pub mod launcher;
pub mod protocol;
pub mod remote;
pub mod session;

// Re-export the types most tests need
pub use common::{Error, Result};
pub use protocol::{RemoteFailure, StepOutcome, StepRequest};
pub use remote::registry::{StepError, StepRegistry, StepResolver};
pub use remote::{AppContext, AppHandle, HostedApp};
pub use session::{Session, SessionBuilder};

pub mod ledger;
pub mod runtime;

pub use ledger::{MemoryTaskLedger, TaskLedger, TaskSnapshot};
pub use runtime::{
    ControlAction, DownloadSession, NewSession, SessionError, SessionRuntime, SessionStatus, Stage,
};

//! Backend connection pool and director-driven fetch engine (§4.1, §4.2).
pub mod connwait;
pub mod director;
pub mod pool;

pub use connwait::{ConnWait, WaitState};
pub use director::Director;
pub use pool::{ConnPool, PfdState};

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum BeError {
    #[error("backend {0}: unhealthy")]
    Unhealthy(String),
    #[error("backend {0}: busy")]
    Busy(String),
    #[error("backend {0}: wait-queue timeout")]
    WaitTimeout(String),
    #[error("backend {0}: connect failed ({1})")]
    ConnectFailed(String, String),
    #[error("backend {0}: held down until retry window elapses")]
    HeldDown(String),
    #[error("backend {0}: first-byte timeout")]
    ResponseTimeout(String),
    #[error("out of workspace while preparing bereq")]
    OutOfWorkspace,
}

//! Subagent execution orchestration.
//!
//! Drives repeated invocations of an external coding subagent across a bounded
//! or unbounded number of iterations through one of two transports. The
//! architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure logic (types, error classification, recovery and
//!   rate-limit policy, statistics, stream parsing). No I/O.
//! - **[`io`]**: Side effects (configuration, hooks, subprocesses, backends,
//!   the session store).
//!
//! [`engine`] runs the iteration loop over a backend; [`run`] records an
//! execution into the session store.

pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod observers;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

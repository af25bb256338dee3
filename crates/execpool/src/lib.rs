//! `execpool` -- a pool of pre-spawned worker processes.
//!
//! Starting a process per request is slow. A [`Pool`] keeps a fixed number of
//! identical workers alive, each waiting to read one input on stdin and write
//! its result to stdout. [`Pool::exec`] checks a worker out, feeds it the
//! caller's input in the background, starts a replacement, and returns the
//! worker's stdout as an [`Output`] stream:
//!
//! - reading to the end waits for the worker to exit; a failing exit status,
//!   a kill, or an input error becomes the stream's error;
//! - the first error recorded for a worker is the only one its reader sees;
//! - if a replacement worker cannot be started the pool fails permanently
//!   and every later checkout returns an [`ErrorStream`].

pub mod config;
pub mod error;
pub mod output;
pub mod pool;
pub mod process;
pub mod spec;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, ExitError, Result, SpawnError};
pub use output::{ErrorStream, Output};
pub use pool::Pool;
pub use process::Process;
pub use spec::ProcessSpec;

#![forbid(unsafe_code)]

extern crate self as msgrpc;

pub use msgrpc_macro::service;

mod error;
pub use error::{BoxError, Error, ErrorKind, Result};

mod envelope;
pub use envelope::{METHOD_KEY, Request, Response, StatusCode};

mod codec;
pub use codec::Codec;

pub mod procedure;
pub use procedure::{Args, Procedure, into_value};

mod router;
pub use router::{Handler, Method, Router};

mod dispatcher;
pub use dispatcher::{Dispatcher, Next};

mod transport;
pub use transport::{DirectTransport, Transport};

mod client;
pub use client::{Client, ClientConfig, Stub};

mod correlation;
pub use correlation::CorrelationId;

mod registry;
pub use registry::{Gathered, PendingRegistry};

mod task_supervisor;
pub use task_supervisor::{TaskSupervisor, TaskSupervisorGuard};

pub mod bus;

pub mod socket;
pub use socket::{SocketServer, SocketTransport, WorkerPoolConfig};

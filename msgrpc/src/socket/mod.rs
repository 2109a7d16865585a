//! Multipart request/reply frames over TCP.
//!
//! A frame is a list of parts: the last part is the encoded envelope, any
//! leading parts are routing data that the answering side echoes back
//! verbatim. The server prepends the identity of the connection a frame
//! came in on, so replies find their way back without a correlation ID.
//! The client adds one routing part of its own to match replies to the
//! calls waiting for them.

const MAGIC_NUM: u32 = u32::from_be_bytes(*b"MRPC");
const MAX_MSG_SIZE: usize = 64 << 20;

mod frame;
pub use frame::{Frame, FrameFlags};

mod connection;

mod pool;
pub use pool::{WorkerPool, WorkerPoolConfig};

mod waiter;
pub use waiter::{WaitReceiver, Waiter};

mod server;
pub use server::SocketServer;

mod client;
pub use client::SocketTransport;

/// Correlated request/response protocol over one JSONL channel per worker
///
/// - `protocol`: wire types and line classification
/// - `expose`: callee side, runs inside the worker
/// - `caller`: caller side, produces a `RemoteProxy` in the parent

pub mod caller;
pub mod expose;
pub mod protocol;

pub use caller::{CallerSide, ChannelFault, PendingReply, RemoteMethod, RemoteProxy};
pub use expose::{arg, worker_index, ExposeSide, Methods, LIFECYCLE_METHODS, WORKER_INDEX_ENV};
pub use protocol::{
    generate_request_id, Incoming, LineRead, LineReader, Request, Response, MAX_LINE_BYTES,
};

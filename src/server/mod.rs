pub mod listener;
pub mod pipeline;
pub mod upstream;
pub mod workers;

pub use listener::ProxyServer;
pub use pipeline::{service_client, RequestContext};
pub use upstream::{PoolStats, UpstreamConn, UpstreamPool};
pub use workers::{SubmitOutcome, Task, WorkerPool};

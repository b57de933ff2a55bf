//! The resolver/scatter dispatch core: translates routing
//! hints into live shard handles, executes a `Plan` tree against them with
//! retry-on-resharding, and tracks per-session transactional state.

pub mod config;
pub mod debug;
pub mod resolver;
pub mod router;
pub mod scatter;
pub mod session;

pub use config::RouterConfig;
pub use resolver::{resolved_shards_equal, ResolvedShard, Resolver};
pub use router::{ExecContext, Router};
pub use scatter::{ExecuteOptions, ScatterConn};
pub use session::{CommitMode, Session, ShardSession, TransactionResolver};

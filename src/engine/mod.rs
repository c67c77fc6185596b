//! External download engine (aria2): process supervision and RPC.
//!
//! - [`EngineSupervisor`] - owns the engine process, its port, secret and logs
//! - [`EngineRpcClient`] - typed JSON-RPC client for that process
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use mirror_core::engine::{EngineConfig, EngineRpcClient, EngineSupervisor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut supervisor = EngineSupervisor::new(EngineConfig::default())?;
//! supervisor.start()?;
//!
//! let rpc = EngineRpcClient::new(&supervisor.rpc_url(), supervisor.secret())?;
//! rpc.wait_until_ready(Duration::from_secs(10)).await?;
//! let stat = rpc.get_global_stat().await?;
//! println!("{} active", stat.num_active);
//!
//! supervisor.stop();
//! # Ok(())
//! # }
//! ```

mod error;
mod rpc;
mod supervisor;
mod types;

pub use error::{EngineError, RpcError};
pub use rpc::{AddUriOptions, DEFAULT_READY_TIMEOUT, DEFAULT_USER_AGENT, EngineRpcClient};
pub use supervisor::{
    DEFAULT_RPC_PORT, EngineConfig, EngineSupervisor, MAX_PORT_ATTEMPTS, SECRET_LEN,
    build_args, generate_secret, next_log_paths, probe_port,
};
pub use types::{
    FileEntry, GlobalStat, SessionInfo, TaskStatus, TransferState, UriEntry, UriState,
    VersionInfo,
};

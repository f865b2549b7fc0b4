//! CLI configuration: a `clap`-derived struct plus small helpers the
//! subcommands share.

use clap::{Parser, Subcommand};

/// memo-node: a content-addressed store, memoizing evaluator, and HTTP
/// wire-protocol server/client in one binary.
#[derive(Parser, Debug)]
#[command(name = "memo-node", version, about, long_about = None)]
pub struct Cli {
    /// Store URI: `sqlite:<path>`, `redb:<path>`, `car:<path>`, or
    /// `http(s)://host:port/` for a remote store.
    #[arg(long, global = true, default_value = "sqlite::memory:?mode=memory")]
    pub store: String,

    /// Create the backing file if it does not already exist.
    #[arg(long, global = true)]
    pub create: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP wire-protocol server (§6.2) over `--store`.
    Serve {
        /// TCP listen address.
        #[arg(long, default_value = "127.0.0.1:8088")]
        listen: String,
        /// Worker threads for the local evaluator; 0 disables background
        /// evaluation (futures are driven lazily by whoever calls `get`).
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Register the built-in demo funcs (`square`) so `/call/.../evaluate`
        /// has something to run locally instead of only queuing for workers.
        #[arg(long)]
        register_demo_funcs: bool,
    },
    /// Run a standalone worker against a remote server, pulling jobs via
    /// `POST /worker` and executing the built-in demo funcs.
    Worker {
        /// Base URL of the remote memo-node server.
        server: String,
    },
    /// Fetch a block by CID and print it as MemoDB JSON.
    Get { cid: String },
    /// Read MemoDB JSON from stdin, `put` it, and print the resulting CID.
    Put,
    /// Head (mutable symbolic name) operations.
    #[command(subcommand)]
    Head(HeadCommand),
    /// Memoized-call operations.
    #[command(subcommand)]
    Call(CallCommand),
    /// Evaluate a memoized call, printing the result CID (§4.6).
    Evaluate {
        func: String,
        /// Argument CIDs, comma-free (one per occurrence of this flag).
        #[arg(required = true)]
        args: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum HeadCommand {
    Get { name: String },
    Set { name: String, cid: String },
    Delete { name: String },
    List,
}

#[derive(Subcommand, Debug)]
pub enum CallCommand {
    List { func: String },
    Invalidate { func: String },
}

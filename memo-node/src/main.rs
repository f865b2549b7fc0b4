//! Entry point wiring a `Store`, an `Evaluator`, and the HTTP
//! server/client together behind one CLI.

mod config;

use clap::Parser;
use config::{CallCommand, Cli, Command, HeadCommand};
use memo_client::ClientEvaluator;
use memo_core::{Call, Cid, Node};
use memo_eval::{EvalError, Evaluator, Func, ThreadPoolEvaluator};
use memo_server::ServerState;
use memo_store::{Store, StoreExt};
use std::io::Read;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// The one demo func every mode registers: squares an integer argument.
/// Stands in for the application-specific funcs a real deployment would
/// register instead.
fn square_func() -> Func {
    Arc::new(|evaluator: &dyn Evaluator, call: &Call| -> Result<Node, EvalError> {
        let arg = evaluator.store().get(&call.args[0])?;
        let x = arg.as_integer().ok_or_else(|| {
            EvalError::Func(
                "square".to_string(),
                Arc::new(std::io::Error::new(std::io::ErrorKind::InvalidData, "argument is not an integer")),
            )
        })?;
        Ok(Node::Integer(x * x))
    })
}

fn square_client_func() -> memo_client::Func {
    Arc::new(|evaluator: &ClientEvaluator, call: &Call| -> Result<Node, memo_client::ClientError> {
        let arg = evaluator.store().get(&call.args[0])?;
        let x = arg
            .as_integer()
            .ok_or_else(|| memo_client::ClientError::Func("square".to_string(), "argument is not an integer".into()))?;
        Ok(Node::Integer(x * x))
    })
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let store: Arc<dyn Store> = Arc::from(memo_store::open(&cli.store, cli.create)?);

    match cli.command {
        Command::Serve {
            listen,
            threads,
            register_demo_funcs,
        } => serve(store, &listen, threads, register_demo_funcs)?,
        Command::Worker { server } => run_worker(server)?,
        Command::Get { cid } => get(&*store, &cid)?,
        Command::Put => put(&*store)?,
        Command::Head(cmd) => head(&*store, cmd)?,
        Command::Call(cmd) => call(&*store, cmd)?,
        Command::Evaluate { func, args } => evaluate(store, &func, &args)?,
    }
    Ok(())
}

fn serve(store: Arc<dyn Store>, listen: &str, threads: usize, register_demo_funcs: bool) -> anyhow::Result<()> {
    let evaluator = if threads > 0 {
        let evaluator = ThreadPoolEvaluator::new(store.clone(), threads);
        if register_demo_funcs {
            evaluator.register_func("square", square_func());
        }
        Some(evaluator)
    } else {
        None
    };
    let state = ServerState::new(store, evaluator);
    let router = memo_server::router(state);

    let addr: std::net::SocketAddr = listen.parse()?;
    tracing::info!(%addr, "memo-node: serving");

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn run_worker(server: String) -> anyhow::Result<()> {
    let client = ClientEvaluator::new(&server)?;
    client.register_func("square", square_client_func());
    tracing::info!(server = %server, "memo-node: running as a worker");
    client.run_worker_loop();
    Ok(())
}

fn get(store: &dyn Store, cid: &str) -> anyhow::Result<()> {
    let cid = Cid::parse(cid)?;
    let node = store.get(&cid)?;
    println!("{}", serde_json::to_string_pretty(&node.to_json())?);
    Ok(())
}

fn put(store: &dyn Store) -> anyhow::Result<()> {
    let mut text = String::new();
    std::io::stdin().read_to_string(&mut text)?;
    let node = Node::load_from_json(&text)?;
    let cid = store.put(&node)?;
    println!("{}", cid);
    Ok(())
}

fn head(store: &dyn Store, cmd: HeadCommand) -> anyhow::Result<()> {
    match cmd {
        HeadCommand::Get { name } => println!("{}", store.head_get(&name)?),
        HeadCommand::Set { name, cid } => store.head_set(&name, &Cid::parse(&cid)?)?,
        HeadCommand::Delete { name } => store.head_delete(&name)?,
        HeadCommand::List => {
            for name in store.list_heads()? {
                println!("{}", name);
            }
        }
    }
    Ok(())
}

fn call(store: &dyn Store, cmd: CallCommand) -> anyhow::Result<()> {
    match cmd {
        CallCommand::List { func } => {
            for call in store.list_calls(&func)? {
                let args: Vec<String> = call.args.iter().map(|c| c.to_string()).collect();
                println!("{}({})", call.name, args.join(", "));
            }
        }
        CallCommand::Invalidate { func } => store.call_invalidate(&func)?,
    }
    Ok(())
}

fn evaluate(store: Arc<dyn Store>, func: &str, args: &[String]) -> anyhow::Result<()> {
    let args = args
        .iter()
        .map(|a| Cid::parse(a))
        .collect::<Result<Vec<_>, _>>()?;
    let call = Call::new(func, args);

    let evaluator = ThreadPoolEvaluator::new(store, 1);
    evaluator.register_func("square", square_func());
    let cid = evaluator.evaluate(&call)?;
    println!("{}", cid);
    Ok(())
}

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Args, Parser, Subcommand};
use schemad::{
    Cluster, ClusterOptions, MachineSpec, MemStore, QueryEnv, Term, metrics, query, telemetry,
    util::print_value,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "schemad")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start an in-process cluster and an interactive term REPL against it
    Repl(ClusterArgs),
    /// Start an in-process cluster, evaluate one JSON term and exit
    Exec {
        #[command(flatten)]
        cluster: ClusterArgs,
        term: String,
    },
}

#[derive(Args)]
struct ClusterArgs {
    #[arg(long, default_value_t = 3)]
    machines: usize,
    /// Datacenter names, assigned to machines round-robin
    #[arg(long)]
    datacenter: Vec<String>,
    /// Persist each node's metadata under this directory
    #[arg(long)]
    metadata_dir: Option<PathBuf>,
    #[arg(long, default_value = "test")]
    default_db: String,
    /// Node that evaluates terms
    #[arg(long, default_value_t = 0)]
    node: usize,
}

impl ClusterArgs {
    async fn start(&self) -> Result<Cluster, Box<dyn std::error::Error>> {
        let specs: Vec<MachineSpec> = (0..self.machines)
            .map(|i| {
                let spec = MachineSpec::new(format!("machine_{i}"));
                match self.datacenter.get(i % self.datacenter.len().max(1)) {
                    Some(dc) => spec.in_datacenter(dc.clone()),
                    None => spec,
                }
            })
            .collect();
        let options = ClusterOptions {
            default_db: self.default_db.clone(),
            metadata_dir: self.metadata_dir.clone(),
            ..ClusterOptions::default()
        };
        let cluster = Cluster::start(options, specs, Arc::new(MemStore::new())).await?;
        info!(machines = self.machines, "cluster started");
        Ok(cluster)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    telemetry::init_tracing()?;
    match cli.command {
        Command::Repl(args) => {
            let cluster = args.start().await?;
            repl(&cluster, args.node).await?;
            cluster.shutdown();
        }
        Command::Exec { cluster: args, term } => {
            let cluster = args.start().await?;
            let term = Term::parse(&term)?;
            let value = eval(&cluster, args.node, &term).await?;
            print_value(&value, &mut std::io::stdout())?;
            cluster.shutdown();
        }
    }
    Ok(())
}

/// Evaluate `term` on node `idx`; ctrl-c interrupts it.
async fn eval(
    cluster: &Cluster,
    idx: usize,
    term: &Term,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let node = cluster
        .node(idx)
        .ok_or_else(|| format!("no node at index {idx}"))?
        .clone();
    let interruptor = CancellationToken::new();
    let env = QueryEnv::with_interruptor(node, interruptor.clone());
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interruptor.cancel();
        }
    });
    let result = match query::run(&env, term).await {
        Ok(output) => output.collect().await,
        Err(err) => Err(err),
    };
    watcher.abort();
    Ok(result?)
}

async fn repl(cluster: &Cluster, mut node: usize) -> Result<(), Box<dyn std::error::Error>> {
    use rustyline::{Editor, error::ReadlineError, history::DefaultHistory};
    let rl = Arc::new(Mutex::new(Editor::<(), DefaultHistory>::new()?));
    loop {
        let rl_clone = rl.clone();
        let prompt = format!("{node}> ");
        let line = tokio::task::spawn_blocking(move || {
            let mut rl = rl_clone.lock().map_err(|_| ReadlineError::Interrupted)?;
            let line = rl.readline(&prompt);
            if let Ok(ref l) = line {
                let _ = rl.add_history_entry(l.as_str());
            }
            line
        })
        .await?;
        let line = match line {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let input = line.trim();
        match input {
            "" => continue,
            ".quit" => return Ok(()),
            ".metrics" => {
                print!("{}", metrics::render());
                continue;
            }
            ".dump" => {
                if let Some(n) = cluster.node(node) {
                    println!("{}", serde_json::to_string_pretty(&*n.home().snapshot())?);
                }
                continue;
            }
            _ => {}
        }
        if let Some(idx) = input.strip_prefix(".node ") {
            match idx.trim().parse::<usize>() {
                Ok(idx) if idx < cluster.nodes().len() => node = idx,
                _ => eprintln!("expected a node index below {}", cluster.nodes().len()),
            }
            continue;
        }

        let result = match Term::parse(input) {
            Ok(term) => eval(cluster, node, &term).await,
            Err(err) => Err(err.into()),
        };
        match result {
            Ok(value) => print_value(&value, &mut std::io::stdout())?,
            Err(err) => eprintln!("query failed: {err}"),
        }
    }
}

//! Command-line client for an agent host.
//!
//! ```text
//! agenthost-ctl create echo --id a1
//! agenthost-ctl call a1 slow_fn --arg '{"ms":500,"value":1}' --async
//! agenthost-ctl fetch 1 --wait-ms 2000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use agenthost::dispatch::Argument;
use agenthost::grpc::proto::TaskStatus;
use agenthost::grpc::{ClientError, HostClient};
use agenthost::Payload;

#[derive(Debug, Parser)]
#[command(name = "agenthost-ctl", version, about = "Talk to an agent host")]
struct Cli {
    /// Host address
    #[arg(long, short, env = "AGENTHOST_ADDR", default_value = "127.0.0.1:12310")]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check the host is serving
    Alive,
    /// Ask the host to shut down
    Stop,
    /// Create an object
    Create {
        class_name: String,
        #[arg(long, default_value = "")]
        id: String,
        /// Init arguments (JSON for the builtin classes)
        #[arg(long, default_value = "")]
        init: String,
    },
    /// Delete one object
    Delete { object_id: String },
    /// Delete every object
    DeleteAll,
    /// Deep-copy an object
    Clone { object_id: String },
    /// List live objects
    List,
    /// Show server info
    Info,
    /// Print the host's prometheus metrics
    Metrics,
    /// Push model configuration from a JSON file
    SetConfig {
        file: PathBuf,
        #[arg(long)]
        merge: bool,
    },
    /// Print an object's memory
    Memory { object_id: String },
    /// Call a function
    Call {
        object_id: String,
        function: String,
        /// Inline argument
        #[arg(long, conflicts_with = "from_task")]
        arg: Option<String>,
        /// Use the result of an earlier async call as the argument
        #[arg(long)]
        from_task: Option<u64>,
        /// Return a task id instead of waiting
        #[arg(long = "async")]
        run_async: bool,
    },
    /// Fetch an async result
    Fetch {
        task_id: u64,
        #[arg(long, default_value_t = 0)]
        wait_ms: u64,
    },
    /// Download a file from the host's download root
    Download {
        path: String,
        /// Output file (stdout when omitted)
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
}

impl Command {
    async fn run(self, client: &mut HostClient) -> Result<(), Box<dyn std::error::Error>> {
        match self {
            Command::Alive => println!("alive: {}", client.is_alive().await?),
            Command::Stop => {
                client.stop().await?;
                println!("stopping");
            }
            Command::Create { class_name, id, init } => {
                println!("{}", client.create_object(&id, &class_name, init).await?);
            }
            Command::Delete { object_id } => {
                client.delete_object(&object_id).await?;
                println!("deleted {}", object_id);
            }
            Command::DeleteAll => println!("deleted {}", client.delete_all_objects().await?),
            Command::Clone { object_id } => println!("{}", client.clone_object(&object_id).await?),
            Command::List => {
                for o in client.list_objects().await? {
                    println!("{}\t{}\t{}\t{}ms", o.object_id, o.class_name, o.status, o.age_ms);
                }
            }
            Command::Info => {
                let info = client.server_info().await?;
                println!("server_id:      {}", info.server_id);
                println!("host:           {}:{} (pid {})", info.host, info.port, info.pid);
                println!("uptime:         {}ms", info.uptime_ms);
                println!("cpu:            {:.1}%", info.cpu_percent);
                println!("memory:         {} bytes", info.memory_bytes);
                println!("objects:        {}", info.object_count);
                println!(
                    "tasks:          {} pending, {} stored",
                    info.pending_tasks, info.stored_results
                );
                println!(
                    "calls:          {} in flight, {} queued",
                    info.in_flight_calls, info.queued_calls
                );
                println!("config version: {}", info.config_version);
            }
            Command::Metrics => print!("{}", client.metrics().await?),
            Command::SetConfig { file, merge } => {
                let blob = std::fs::read(&file)?;
                println!("version {}", client.set_config(blob, merge).await?);
            }
            Command::Memory { object_id } => {
                let memory = client.get_memory(&object_id).await?;
                println!("{}", String::from_utf8_lossy(&memory));
            }
            Command::Call { object_id, function, arg, from_task, run_async } => {
                let argument = match from_task {
                    Some(task_id) => Argument::Placeholder(task_id),
                    None => Argument::Inline(Payload::from(arg.unwrap_or_default())),
                };
                if run_async {
                    println!("task {}", client.call_async(&object_id, &function, argument).await?);
                } else {
                    let result = client.call(&object_id, &function, argument).await?;
                    print_outcome(result.ok, &result.result, &result.message);
                }
            }
            Command::Fetch { task_id, wait_ms } => {
                let fetched = client.fetch_result(task_id, Duration::from_millis(wait_ms)).await?;
                match fetched.status() {
                    TaskStatus::Pending => println!("pending"),
                    TaskStatus::Ready => {
                        print_outcome(fetched.ok, &fetched.result, &fetched.message)
                    }
                    TaskStatus::Failed => println!("failed: {}", fetched.message),
                }
            }
            Command::Download { path, out } => {
                let data = client.download(&path).await?;
                match out {
                    Some(out) => {
                        std::fs::write(&out, &data)?;
                        eprintln!("wrote {} bytes to {}", data.len(), out.display());
                    }
                    None => {
                        use std::io::Write;
                        std::io::stdout().write_all(&data)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn print_outcome(ok: bool, result: &[u8], message: &str) {
    if ok {
        println!("{}", String::from_utf8_lossy(result));
    } else {
        println!("error: {}", message);
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut client = match HostClient::connect(&cli.addr).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("cannot reach {}: {}", cli.addr, e);
            std::process::exit(2);
        }
    };

    if let Err(e) = cli.command.run(&mut client).await {
        match e.downcast_ref::<ClientError>() {
            Some(ClientError::Status(status)) => {
                eprintln!("{:?}: {}", status.code(), status.message())
            }
            _ => eprintln!("{}", e),
        }
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_builds() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_call_argument_flags_conflict() {
        let parsed = Cli::try_parse_from([
            "agenthost-ctl",
            "call",
            "a",
            "echo",
            "--arg",
            "x",
            "--from-task",
            "1",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_metrics_subcommand() {
        let cli = Cli::try_parse_from(["agenthost-ctl", "metrics"]).unwrap();
        assert!(matches!(cli.command, Command::Metrics));
    }

    #[test]
    fn test_async_flag() {
        let cli = Cli::try_parse_from(["agenthost-ctl", "call", "a", "ping", "--async"]).unwrap();
        assert!(matches!(cli.command, Command::Call { run_async: true, .. }));
    }
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::net::UnixStream;

use supd::manager::{run_daemon, DaemonOptions};
use supd::protocol::{self, Request, Response};

#[derive(Parser)]
#[command(name = "supd")]
#[command(about = "SMF-style service supervisor")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor daemon
    Run {
        /// Directory of service declaration files
        #[arg(long, default_value = "/etc/supd/services")]
        services_dir: PathBuf,

        /// Admin socket path
        #[arg(long, default_value = protocol::SOCKET_PATH)]
        socket: PathBuf,
    },

    /// Enable a service or instance
    Enable {
        /// Path (e.g. "db" or "db:main")
        path: String,
    },

    /// Disable a service or instance
    Disable {
        /// Path (e.g. "db" or "db:main")
        path: String,
    },

    /// Show one instance's status
    Status {
        /// Instance path (e.g. "db:main")
        path: String,
    },

    /// List all instances
    List,

    /// Dump the dependency graph in DOT form
    Dot,

    /// Check the daemon is answering
    Ping,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.command {
        Command::Run {
            services_dir,
            socket,
        } => {
            run_daemon(DaemonOptions {
                services_dir,
                socket_path: socket,
                ..DaemonOptions::default()
            })
            .await?;
        }
        Command::Enable { path } => {
            print_response(request(Request::Enable { path }).await?);
        }
        Command::Disable { path } => {
            print_response(request(Request::Disable { path }).await?);
        }
        Command::Status { path } => {
            print_response(request(Request::Status { path }).await?);
        }
        Command::List => {
            print_response(request(Request::List).await?);
        }
        Command::Dot => {
            print_response(request(Request::DotGraph).await?);
        }
        Command::Ping => {
            print_response(request(Request::Ping).await?);
        }
    }

    Ok(())
}

async fn request(req: Request) -> Result<Response, Box<dyn std::error::Error>> {
    let mut stream = UnixStream::connect(protocol::SOCKET_PATH).await?;
    protocol::write_msg(&mut stream, &req).await?;
    Ok(protocol::read_msg(&mut stream).await?)
}

fn print_response(resp: Response) {
    match resp {
        Response::Ok => println!("ok"),
        Response::Pong => println!("pong"),
        Response::Dot(dot) => print!("{}", dot),
        Response::Status(info) => {
            println!(
                "{}  graph={} unit={} enabled={}",
                info.path, info.graph_state, info.unit_state, info.enabled
            );
        }
        Response::Units(units) => {
            for info in units {
                println!(
                    "{}  graph={} unit={} enabled={}",
                    info.path, info.graph_state, info.unit_state, info.enabled
                );
            }
        }
        Response::Error(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

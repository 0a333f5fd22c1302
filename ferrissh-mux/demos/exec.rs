//! Run one command on a remote host and print its output.
//!
//! # Usage
//!
//! With password authentication:
//! ```bash
//! cargo run --example exec -- --host localhost --user your_username --password your_password -- uname -a
//! ```
//!
//! With SSH key authentication, trusting whatever key the host presents:
//! ```bash
//! cargo run --example exec -- --host localhost --key ~/.ssh/id_ed25519 --insecure -- uptime
//! ```
//!
//! Without `--insecure` the host key is checked against `~/.ssh/known_hosts`
//! and learned on first contact.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use ferrissh_mux::{
    Client, ClientConfigBuilder, KnownHostsPolicy, Network, insecure_ignore_host_key, known_hosts,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (set RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut builder = ClientConfigBuilder::new(&args.user).timeout(Duration::from_secs(args.timeout));
    if let Some(key_path) = &args.key {
        builder = builder.private_key(key_path);
    }
    if let Some(password) = &args.password {
        builder = builder.password(password);
    }
    builder = if args.insecure {
        builder.host_key_callback(insecure_ignore_host_key())
    } else {
        builder.host_key_callback(known_hosts(KnownHostsPolicy::AcceptNew, None))
    };
    if let Some(idle) = args.idle {
        builder = builder.idle_timeout(Duration::from_secs(idle));
    }

    // Ctrl-C abandons the connection attempt or the running command.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let addr = format!("{}:{}", args.host, args.port);
    println!("Connecting to {addr}...");
    let client = Client::dial(Network::Tcp, &addr, builder.build(), cancel).await?;
    println!("Connected to {}", client.remote_addr());

    let session = client.open_session().await?;
    let output = session.output(&args.command).await?;

    print!("{}", output.stdout_str());
    eprint!("{}", output.stderr_str());
    match output.exit_status {
        Some(code) => println!("exit status: {code}"),
        None => println!("exit status: unknown"),
    }

    session.close().await?;
    client.close().await;
    Ok(())
}

/// Simple argument parser (avoiding external dependencies)
struct Args {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    key: Option<PathBuf>,
    insecure: bool,
    timeout: u64,
    idle: Option<u64>,
    command: String,
}

impl Args {
    fn parse() -> Self {
        let mut args = env::args().skip(1);
        let mut parsed = Self {
            host: "localhost".to_string(),
            port: 22,
            user: env::var("USER").unwrap_or_else(|_| "root".to_string()),
            password: None,
            key: None,
            insecure: false,
            timeout: 30,
            idle: None,
            command: "uname -a".to_string(),
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--host" | "-h" => parsed.host = args.next().unwrap_or(parsed.host),
                "--port" | "-p" => {
                    parsed.port = args.next().and_then(|v| v.parse().ok()).unwrap_or(22)
                }
                "--user" | "-u" => parsed.user = args.next().unwrap_or(parsed.user),
                "--password" | "-P" => parsed.password = args.next(),
                "--key" | "-k" => parsed.key = args.next().map(PathBuf::from),
                "--insecure" => parsed.insecure = true,
                "--timeout" | "-t" => {
                    parsed.timeout = args.next().and_then(|v| v.parse().ok()).unwrap_or(30)
                }
                "--idle" => parsed.idle = args.next().and_then(|v| v.parse().ok()),
                "--help" => {
                    Self::print_help();
                    std::process::exit(0);
                }
                "--" => {
                    let rest: Vec<String> = args.by_ref().collect();
                    if !rest.is_empty() {
                        parsed.command = rest.join(" ");
                    }
                }
                other => eprintln!("Unknown argument: {other}"),
            }
        }
        parsed
    }

    fn print_help() {
        println!(
            r#"ferrissh-mux exec example

USAGE:
    cargo run --example exec -- [OPTIONS] [-- COMMAND...]

OPTIONS:
    -h, --host <HOST>        Target host [default: localhost]
    -p, --port <PORT>        SSH port [default: 22]
    -u, --user <USER>        Username [default: $USER]
    -P, --password <PASS>    Password for authentication
    -k, --key <PATH>         Path to SSH private key
        --insecure           Accept any host key
    -t, --timeout <SECS>     Connect timeout [default: 30]
        --idle <SECS>        Fail reads after this long without output
    --help                   Print this help message
"#
        );
    }
}

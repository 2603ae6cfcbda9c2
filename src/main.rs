//! Akari - an invisible proxy

use std::sync::Arc;

use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use akari::agent::Agent;
use akari::config::{self, Config, Mode};
use akari::server::Server;
use akari::Result;

fn main() {
    let args = Args::parse();

    if matches!(args.command, Some(Command::Version)) {
        println!("akari v{}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let cfg = match load_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    if matches!(args.command, Some(Command::ConfigFile)) {
        println!(
            "{}",
            serde_json::to_string_pretty(&cfg).expect("serialize config")
        );
        return;
    }

    init_logging(cfg.log_level);
    info!(
        "starting akari version {} configfile {}",
        env!("CARGO_PKG_VERSION"),
        args.config
            .as_deref()
            .unwrap_or(config::DEFAULT_CONFIG_FILE)
    );

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(run(cfg)) {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    match cfg.mode {
        Mode::Server => {
            let server = Arc::new(Server::new(&cfg).await?);
            {
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.serve().await {
                        error!("server: accept error: {}", e);
                        std::process::exit(1);
                    }
                });
            }
            wait_for_shutdown(|| async move { server.close().await }).await;
        }
        Mode::Agent => {
            let agent = Arc::new(Agent::new(&cfg).await?);
            agent.serve();
            wait_for_shutdown(|| async move { agent.close().await }).await;
        }
    }
    info!("akari stopped");
    Ok(())
}

/// First signal triggers graceful shutdown; a second one terminates
/// immediately.
#[cfg(unix)]
async fn wait_for_shutdown<F, Fut>(close: F)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    warn!("signal received, stopping akari");

    let graceful = tokio::spawn(close());
    tokio::select! {
        _ = graceful => {}
        _ = interrupt.recv() => info!("second signal received, stopping immediately"),
        _ = terminate.recv() => info!("second signal received, stopping immediately"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown<F, Fut>(close: F)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::signal::ctrl_c().await.expect("install ctrl-c handler");
    warn!("signal received, stopping akari");

    let graceful = tokio::spawn(close());
    tokio::select! {
        _ = graceful => {}
        _ = tokio::signal::ctrl_c() => info!("second signal received, stopping immediately"),
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let cfg = match &args.config {
        // An explicitly named config file must load.
        Some(path) => Config::load(path)?,
        None => {
            let path = std::path::Path::new(config::DEFAULT_CONFIG_FILE);
            if path.exists() {
                Config::load(path)?
            } else {
                Config::default()
            }
        }
    };
    Ok(match args.log_level {
        Some(level) => Config { log_level: level, ..cfg },
        None => cfg,
    })
}

fn init_logging(log_level: u8) {
    let level = match log_level {
        5 => Level::DEBUG,
        4 => Level::INFO,
        3 => Level::WARN,
        _ => Level::ERROR,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");
}

/// Command line arguments
struct Args {
    config: Option<String>,
    log_level: Option<u8>,
    command: Option<Command>,
}

enum Command {
    Version,
    ConfigFile,
}

impl Args {
    fn parse() -> Self {
        let argv: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut log_level = None;
        let mut command = None;

        let mut i = 1;
        while i < argv.len() {
            match argv[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < argv.len() {
                        config = Some(argv[i + 1].clone());
                        i += 1;
                    }
                }
                "--log-level" => {
                    if i + 1 < argv.len() {
                        log_level = argv[i + 1].parse().ok();
                        i += 1;
                    }
                }
                "version" => command = Some(Command::Version),
                "configfile" => command = Some(Command::ConfigFile),
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("unknown argument: {}", other);
                    print_help();
                    std::process::exit(1);
                }
            }
            i += 1;
        }

        Self {
            config,
            log_level,
            command,
        }
    }
}

fn print_help() {
    println!(
        r#"akari - an invisible proxy

USAGE:
    akari [OPTIONS] [COMMAND]

COMMANDS:
    version       Print the akari version
    configfile    Print the effective configuration as JSON

OPTIONS:
    -c, --config <FILE>     Config file (default is /etc/akari/akari.json)
    --log-level <0..5>      debug=5, info=4, warn=3, error=2, fatal=1, panic=0
    -h, --help              Print help information
"#
    );
}

use clap::Parser;
use log::{error, info, LevelFilter};
use ovpn_monitor::configuration::config::Config;
use ovpn_monitor::controller::Controller;
use ovpn_monitor::error_handling::types::RegistryError;
use ovpn_monitor::logging::init_logging;
use ovpn_monitor::registry::user_registry::UserRegistry;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

const EXIT_FATAL: u8 = 1;
const EXIT_REJECTED: u8 = 2;
// Blocking reads stuck on a hung filesystem are abandoned after this.
const RUNTIME_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "ovpn-monitor")]
#[command(version)]
#[command(about = "Per-user traffic accounting for an OpenVPN server")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "OVPN_MONITOR_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Register a user, then exit unless --daemon is given
    #[arg(
        long,
        num_args = 3,
        value_names = ["REAL_IP", "VIRTUAL_IP", "COMMON_NAME"],
        conflicts_with = "delete"
    )]
    add: Option<Vec<String>>,

    /// Remove a user, then exit unless --daemon is given
    #[arg(long, value_name = "REAL_IP")]
    delete: Option<IpAddr>,

    /// Keep running as the monitoring daemon after --add/--delete
    #[arg(long)]
    daemon: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Unable to start the async runtime: {}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };
    let code = runtime.block_on(run(args));
    runtime.shutdown_timeout(RUNTIME_GRACE);
    code
}

async fn run(args: Args) -> ExitCode {
    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            let _ = init_logging(LevelFilter::Info, None);
            error!(
                "Unable to import configuration from {}: {}",
                args.config.display(),
                e
            );
            return ExitCode::from(EXIT_FATAL);
        }
    };
    if let Err(e) = init_logging(config.log_level, Some(config.log_file.as_path())) {
        eprintln!("Logger already initialised: {}", e);
    }
    info!("Configuration imported from {}", args.config.display());

    let mutated = args.add.is_some() || args.delete.is_some();
    if mutated {
        if let Err(code) = mutate_registry(&config, &args) {
            return code;
        }
        if !args.daemon {
            return ExitCode::SUCCESS;
        }
    }

    let mut controller = match Controller::new(Arc::new(config)) {
        Ok(c) => c,
        Err(e) => {
            error!("Unable to start the monitor: {}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };

    match controller.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Monitor failed: {}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn mutate_registry(config: &Config, args: &Args) -> Result<(), ExitCode> {
    let mut registry =
        UserRegistry::open(&config.users_file, config.daemon.lock_timeout()).map_err(|e| {
            error!("Unable to open user registry: {}", e);
            ExitCode::from(EXIT_FATAL)
        })?;

    let result = if let Some(values) = &args.add {
        let (real, virt, common_name) = parse_add(values)?;
        registry.add(real, virt, common_name).map(|r| {
            println!("User {} added ({} -> {})", r.common_name, r.real_address, r.virtual_address)
        })
    } else if let Some(real) = args.delete {
        registry
            .delete(real)
            .map(|r| println!("User {} deleted ({})", r.common_name, r.real_address))
    } else {
        Ok(())
    };

    result.map_err(|e| {
        error!("{}", e);
        match e {
            RegistryError::DuplicateKey(_)
            | RegistryError::NotFound(_)
            | RegistryError::InvalidRecord(_) => ExitCode::from(EXIT_REJECTED),
            _ => ExitCode::from(EXIT_FATAL),
        }
    })
}

fn parse_add(values: &[String]) -> Result<(IpAddr, IpAddr, &str), ExitCode> {
    let [real, virt, common_name] = values else {
        error!("--add expects REAL_IP VIRTUAL_IP COMMON_NAME");
        return Err(ExitCode::from(EXIT_REJECTED));
    };
    let parse = |label: &str, raw: &str| {
        raw.parse::<IpAddr>().map_err(|_| {
            error!("Invalid {} '{}'", label, raw);
            ExitCode::from(EXIT_REJECTED)
        })
    };
    Ok((
        parse("real address", real.as_str())?,
        parse("virtual address", virt.as_str())?,
        common_name.as_str(),
    ))
}

use std::{
    path::{Path, PathBuf},
    process::exit,
};

use clap::Parser;

use blackhole::{
    config::{Config, ConfigError},
    logging,
    smtp::connection,
    supervisor::{self, Supervisor, EX_CONFIG, EX_USAGE},
};

const DEFAULT_CONFIG: &str = "/etc/blackhole.conf";

#[derive(Parser)]
#[command(
    name = "blackhole",
    about = "An SMTP sink that accepts, bounces, or drops every message it is offered",
    disable_version_flag = true
)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "conf", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Check the configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Stay attached to the terminal
    #[arg(short = 'b', long = "foreground")]
    foreground: bool,

    /// Detach and run in the background
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// Print the version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// List the TLS protocol versions and cipher suites on offer
    #[arg(short = 'l', long = "list-tls")]
    list_tls: bool,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = if err.use_stderr() { EX_USAGE } else { 0 };
            let _ = err.print();
            exit(code);
        }
    };

    if args.version {
        println!("blackhole {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if args.list_tls {
        list_tls();
        return;
    }

    let (config, path) = match load_config(args.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("blackhole: {err}");
            exit(EX_CONFIG);
        }
    };

    // Unusable TLS material is fatal now, not at the first handshake
    if let (Some(certificate), Some(key)) = (&config.tls_cert, &config.tls_key) {
        if let Err(err) = connection::tls_config(certificate, key) {
            eprintln!("blackhole: {err}");
            exit(EX_CONFIG);
        }
    }

    if args.test {
        println!("Configuration OK");
        return;
    }

    logging::init();

    if args.daemon && !args.foreground {
        if let Err(err) = supervisor::daemonize() {
            eprintln!("blackhole: {err}");
            exit(err.exit_code());
        }
    }

    if let Err(err) = Supervisor::new(config, path).run() {
        eprintln!("blackhole: {err}");
        exit(err.exit_code());
    }
}

/// An explicit `-c` must exist; the default path is optional and its absence
/// means the built-in defaults.
fn load_config(path: Option<&Path>) -> Result<(Config, Option<PathBuf>), ConfigError> {
    match path {
        Some(path) => Config::load(path).map(|config| (config, Some(path.to_path_buf()))),
        None => {
            let default = Path::new(DEFAULT_CONFIG);

            if default.exists() {
                Config::load(default).map(|config| (config, Some(default.to_path_buf())))
            } else {
                Config::parse("").map(|config| (config, None))
            }
        }
    }
}

fn list_tls() {
    use tokio_rustls::rustls;

    let provider = rustls::crypto::aws_lc_rs::default_provider();

    println!("Protocol versions:");
    for version in rustls::ALL_VERSIONS {
        println!("  {:?}", version.version);
    }

    println!("Cipher suites:");
    for suite in &provider.cipher_suites {
        println!("  {:?}", suite.suite());
    }
}

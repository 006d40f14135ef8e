//! certkeeper - Main entry point
//!
//! Issues, renews and checks a TLS certificate for one domain or IP address.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use certkeeper::installer::{ArtifactInstaller, InstalledPaths};
use certkeeper::scheduler::{
    issue_from_config, run_reload_hook, AttemptFailure, RenewalOutcome, RenewalScheduler,
};
use certkeeper::IssuanceReport;
use certkeeper_config::{
    AuthorityConfig, ChallengeConfig, ConfigError, IdentityConfig, IdentityKind, InstallConfig,
    IssuanceConfig, KeyConfig, KeySpec, PollingConfig, DEFAULT_API_BASE,
};

/// certkeeper - TLS certificates for domains and bare IP addresses
#[derive(Parser, Debug)]
#[command(name = "certkeeper")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Issue a certificate from command-line input
    Issue(IssueArgs),
    /// Renew from a saved configuration if the certificate is due
    Renew {
        /// Configuration file path
        #[arg(short = 'c', long = "config", env = "CERTKEEPER_CONFIG")]
        config: PathBuf,

        /// Renew even if the installed certificate is still valid
        #[arg(long = "force")]
        force: bool,
    },
    /// Check periodically and renew when due
    Watch {
        /// Configuration file path
        #[arg(short = 'c', long = "config", env = "CERTKEEPER_CONFIG")]
        config: PathBuf,

        /// Hours between checks (minimum 1)
        #[arg(long = "interval-hours", default_value_t = 12)]
        interval_hours: u64,
    },
    /// Validate a configuration and report the installed certificate
    Check {
        /// Configuration file to check
        #[arg(short = 'c', long = "config", env = "CERTKEEPER_CONFIG")]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
struct IssueArgs {
    /// Domain name or IP address to certify
    #[arg(long = "identity")]
    identity: String,

    /// Identity kind; inferred from the value when omitted
    #[arg(long = "kind")]
    kind: Option<IdentityKind>,

    /// Authority API access key
    #[arg(long = "access-key", env = "CERTKEEPER_ACCESS_KEY", hide_env_values = true)]
    access_key: String,

    /// Authority API base URL
    #[arg(long = "api-base", default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// Requested certificate lifetime in days
    #[arg(long = "validity-days", default_value_t = 90)]
    validity_days: u32,

    /// Existing web root served on port 80; a temporary server is used otherwise
    #[arg(long = "webroot")]
    webroot: Option<PathBuf>,

    /// Key algorithm: rsa[:bits] or ec[:curve]
    #[arg(long = "key-spec", default_value = "ec:prime256v1")]
    key_spec: KeySpec,

    /// Directory receiving the live key and certificates
    #[arg(long = "live-dir", default_value = "/etc/certkeeper/live")]
    live_dir: PathBuf,

    /// Parent directory for per-attempt working files
    #[arg(long = "work-dir")]
    work_dir: Option<PathBuf>,

    /// Bind address of the temporary challenge server
    #[arg(long = "bind", default_value = "0.0.0.0:80")]
    bind: SocketAddr,

    /// Command run after installation, split with shell quoting rules,
    /// e.g. 'sh -c "nginx -s reload"'
    #[arg(long = "reload-command")]
    reload_command: Option<String>,

    /// Persist this configuration for later renewals
    #[arg(long = "save-config")]
    save_config: Option<PathBuf>,
}

impl IssueArgs {
    fn to_config(&self) -> Result<IssuanceConfig, ConfigError> {
        let reload_command = self
            .reload_command
            .as_deref()
            .map(|cmd| {
                shlex::split(cmd).ok_or_else(|| {
                    ConfigError::Invalid(format!("unbalanced quoting in reload command '{}'", cmd))
                })
            })
            .transpose()?;

        Ok(IssuanceConfig {
            identity: IdentityConfig {
                value: self.identity.clone(),
                kind: self.kind,
            },
            authority: AuthorityConfig {
                api_base: self.api_base.clone(),
                access_key: self.access_key.clone(),
                validity_days: self.validity_days,
                strict_domains: true,
                request_timeout_secs: 30,
            },
            key: KeyConfig {
                spec: self.key_spec.clone(),
            },
            challenge: ChallengeConfig {
                webroot: self.webroot.clone(),
                bind: self.bind,
            },
            polling: PollingConfig::default(),
            install: InstallConfig {
                live_dir: self.live_dir.clone(),
                work_dir: self.work_dir.clone(),
                renew_before_days: 30,
                reload_command,
            },
        })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let result = match cli.command {
        Commands::Issue(args) => issue(args),
        Commands::Renew { config, force } => renew(&config, force),
        Commands::Watch {
            config,
            interval_hours,
        } => watch(&config, interval_hours),
        Commands::Check { config } => check(&config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("certkeeper: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Issue from command-line input
fn issue(args: IssueArgs) -> Result<ExitCode> {
    let config = match args.to_config() {
        Ok(config) => config,
        Err(e) => return Ok(report_failure(&AttemptFailure::from(e))),
    };
    match config.validate() {
        Ok(warnings) => {
            for warning in warnings {
                warn!("{}", warning.message);
            }
        }
        Err(e) => return Ok(report_failure(&AttemptFailure::from(e))),
    }

    if let Some(path) = &args.save_config {
        config
            .save(path)
            .with_context(|| format!("Failed to save configuration to {}", path.display()))?;
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
    runtime.block_on(async {
        let cancel = shutdown_token();
        match issue_from_config(&config, cancel).await {
            Ok(report) => {
                print_report(&report);
                // The certificate is installed either way
                let _ = run_reload_hook(&config).await;
                Ok(ExitCode::SUCCESS)
            }
            Err(failure) => Ok(report_failure(&failure)),
        }
    })
}

/// Renew from a saved configuration
fn renew(config_path: &Path, force: bool) -> Result<ExitCode> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
    runtime.block_on(async {
        let scheduler = RenewalScheduler::new(config_path, shutdown_token());
        match scheduler.run_once(force).await {
            Ok(RenewalOutcome::NotDue { expires }) => {
                match expires {
                    Some(expires) => println!("certkeeper: certificate valid until {}, not due", expires),
                    None => println!("certkeeper: certificate not due"),
                }
                Ok(ExitCode::SUCCESS)
            }
            Ok(RenewalOutcome::Renewed { report, reload }) => {
                print_report(&report);
                match reload {
                    Some(Err(e)) => {
                        eprintln!("certkeeper: {}", e);
                        Ok(ExitCode::FAILURE)
                    }
                    _ => Ok(ExitCode::SUCCESS),
                }
            }
            Err(failure) => Ok(report_failure(&failure)),
        }
    })
}

/// Renewal loop
fn watch(config_path: &Path, interval_hours: u64) -> Result<ExitCode> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
    runtime.block_on(async {
        RenewalScheduler::new(config_path, shutdown_token())
            .with_interval(Duration::from_secs(interval_hours.saturating_mul(3600)))
            .run()
            .await;
    });
    Ok(ExitCode::SUCCESS)
}

/// Validate configuration and report the installed certificate
fn check(config_path: &Path) -> Result<ExitCode> {
    let config = match IssuanceConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => return Ok(report_failure(&AttemptFailure::from(e))),
    };
    let identity = match config.identity() {
        Ok(identity) => identity,
        Err(e) => return Ok(report_failure(&AttemptFailure::from(e))),
    };

    println!(
        "certkeeper: configuration file {} is valid",
        config_path.display()
    );
    println!("  identity:   {} ({})", identity, identity.kind());
    println!("  key spec:   {}", config.key.spec);
    println!("  live dir:   {}", config.install.live_dir.display());

    let installer = ArtifactInstaller::new(&config.install.live_dir);
    let expires = installer
        .installed_expiry()
        .context("Failed to read installed certificate")?;
    let due = installer
        .needs_renewal(config.install.renew_before_days)
        .context("Failed to check renewal status")?;

    match expires {
        Some(expires) => println!("  expires:    {}", expires),
        None => println!("  expires:    (no valid certificate installed)"),
    }
    if let Some(meta) = installer.load_meta().context("Failed to read certificate metadata")? {
        println!("  order:      {} (issued {})", meta.order_id, meta.issued);
    }
    println!("  renewal:    {}", if due { "due" } else { "not due" });

    Ok(ExitCode::SUCCESS)
}

/// Cancellation token tripped by SIGINT or SIGTERM
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Received shutdown signal, cancelling");
        token.cancel();
    });
    cancel
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn print_report(report: &IssuanceReport) {
    println!(
        "certkeeper: certificate issued for {} (order {})",
        report.identity, report.order_id
    );
    print_paths(&report.paths);
    if let Some(expires) = report.expires_at {
        println!("  {:<12} {}", "expires", expires);
    }
}

fn print_paths(paths: &InstalledPaths) {
    for (label, path) in paths.entries() {
        println!("  {:<12} {}", label, path.display());
    }
}

fn report_failure(failure: &AttemptFailure) -> ExitCode {
    let category = failure.category();
    eprintln!("certkeeper: {}: {}", category, failure.error);
    if let Some(body) = failure.authority_response() {
        eprintln!("certkeeper: last authority response:");
        eprintln!("{}", body);
    }
    ExitCode::from(u8::try_from(category.exit_code()).unwrap_or(1))
}

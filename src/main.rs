use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use tracing::{error, info, warn};

use bridgelink::bind;
use bridgelink::container::{BridgeMode, ContainerManager, ContainerSpec, CONTAINER_NAME};
use bridgelink::qr;
use bridgelink::runtime::{self, DockerCli};
use bridgelink::session::{LinkError, LinkSession, LinkState, Operator, SessionOptions};
use bridgelink::settings::{self, Settings};

#[derive(Parser)]
#[command(name = "bridgelink")]
#[command(about = "Link the messaging bridge container to an account", long_about = None)]
struct Cli {
    /// Custom configuration directory (default: system config location)
    #[arg(long, global = true)]
    config_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a device-linking session against the bridge container
    Link {
        /// Remote/headless install: temporarily publish the bridge on all
        /// interfaces so the pairing code is reachable from another machine
        #[arg(short, long)]
        remote: bool,

        /// Override the bridge container image
        #[arg(long)]
        image: Option<String>,

        /// Override the credential volume directory
        #[arg(long)]
        volume: Option<std::path::PathBuf>,

        /// Device name shown in the messaging app's linked-devices list
        #[arg(long)]
        device_name: Option<String>,

        /// Host to show in the pairing URL on remote installs
        /// (default: this machine's LAN address)
        #[arg(long)]
        advertise_addr: Option<String>,

        /// Seconds to wait for the pairing code to become ready
        #[arg(long, default_value_t = 90)]
        timeout: u64,

        /// Skip the confirmation prompt and start linking immediately
        #[arg(short, long)]
        yes: bool,

        /// Enable verbose logging (shows info level logs)
        #[arg(short, long)]
        verbose: bool,
    },

    /// Re-bind an already linked bridge container to loopback
    ///
    /// Remediation for a linking session that ended with the exposure
    /// warning: the device is linked but the bridge is still published on
    /// all interfaces.
    Secure,

    /// Show runtime, container, and settings status
    Status,

    /// Stop and remove the bridge container
    Teardown,
}

/// Console implementation of the human-interaction seam: prints the pairing
/// code location (and a terminal QR when the bridge supplied a URI) and
/// blocks on stdin for the scan acknowledgment.
struct ConsoleOperator {
    assume_yes: bool,
    remote: bool,
}

impl Operator for ConsoleOperator {
    fn confirm_start(&mut self) -> bool {
        if self.assume_yes {
            return true;
        }
        print!("Link a device now? [Y/n] ");
        let _ = io::stdout().flush();
        let mut input = String::new();
        if io::stdin().lock().read_line(&mut input).is_err() {
            return false;
        }
        !matches!(input.trim(), "n" | "N" | "no")
    }

    fn present_code(&mut self, qr_url: &str, pairing_uri: Option<&str>) {
        println!("\n📱 Open the messaging app on your phone:");
        println!("   Settings → Linked devices → Link new device");
        if let Some(uri) = pairing_uri {
            if let Err(e) = qr::display_pairing_qr(uri) {
                warn!("could not render QR code: {}", e);
            }
        }
        if self.remote {
            println!("Open this URL from a machine on the same network to view the code:");
        } else {
            println!("View the pairing code in your browser:");
        }
        println!("   {}\n", qr_url);
    }

    fn confirm_scanned(&mut self) {
        print!("Press Enter once you have scanned the code... ");
        let _ = io::stdout().flush();
        let mut input = String::new();
        let _ = io::stdin().lock().read_line(&mut input);
    }
}

/// Report the session outcome with an explicit next step. Never fatal to the
/// surrounding install: a deferred pairing exits zero.
fn report_outcome(session: &LinkSession) {
    match session.state() {
        LinkState::Done => {
            println!(
                "\n✅ Device linked{}.",
                session
                    .linked_number()
                    .map(|n| format!(" as {}", n))
                    .unwrap_or_default()
            );
        }
        LinkState::Linked if session.expose_warning() => {
            // Distinct from ordinary failures: the link is valid but the
            // bridge is still reachable from other machines.
            eprintln!("\n🚨 SECURITY WARNING 🚨");
            eprintln!("The device is linked, but the bridge could not be re-bound to loopback.");
            if session.exposed_container_running() {
                eprintln!("It is still reachable on a non-loopback interface.");
            } else {
                eprintln!("The loopback relaunch failed and the bridge container is not running.");
            }
            if let Some(LinkError::Securing(reason)) = session.failure() {
                eprintln!("Reason: {}", reason);
            }
            eprintln!("Fix it now with: bridgelink secure");
        }
        LinkState::Skipped => match session.failure() {
            Some(LinkError::PrerequisiteMissing(hint)) => {
                println!("\n⏭️  Pairing skipped.\n{}", hint);
                println!("Re-run 'bridgelink link' once the runtime is available.");
            }
            _ => println!("\n⏭️  Pairing skipped. Re-run 'bridgelink link' when ready."),
        },
        LinkState::Failed => match session.failure() {
            Some(LinkError::ContainerStart(e)) => {
                println!("\n❌ The bridge container failed to start: {}", e.message);
                for line in &e.log_tail {
                    println!("   | {}", line);
                }
                println!("Re-run 'bridgelink link' after fixing the runtime issue.");
            }
            Some(e @ (LinkError::ReadinessTimeout(_) | LinkError::Aborted)) => {
                println!("\n❌ {}", e);
                if session.options().remote {
                    println!("The exposed container was stopped; nothing is left listening.");
                    println!("Re-run 'bridgelink link --remote' to try again.");
                } else {
                    println!("If the bridge comes up later, pair manually at:");
                    println!("   {}", session.options().qr_url());
                }
            }
            Some(e @ LinkError::VerificationTimeout { .. }) => {
                println!("\n❌ {}", e);
                println!("Credentials were left intact in case the link landed late.");
                println!("Check manually at: {}", session.options().accounts_url());
            }
            Some(e) => println!("\n❌ Linking failed: {}", e),
            None => println!("\n❌ Linking failed."),
        },
        other => {
            // run() only returns terminal states; anything else is a bug.
            error!("session ended in non-terminal state {:?}", other);
        }
    }
}

async fn cmd_link(
    remote: bool,
    image: Option<String>,
    volume: Option<std::path::PathBuf>,
    device_name: Option<String>,
    advertise_addr: Option<String>,
    timeout: u64,
    yes: bool,
) -> Result<()> {
    let mut settings = Settings::load()?;
    settings.remote = remote || settings.remote;
    if let Some(image) = image {
        settings.image = image;
    }
    if let Some(volume) = volume {
        settings.volume_dir = Some(volume);
    }
    if let Some(name) = device_name {
        settings.device_name = name;
    }
    settings.save()?;

    let mut opts = SessionOptions::from_settings(&settings);
    opts.readiness_timeout = std::time::Duration::from_secs(timeout);
    if let Some(addr) = advertise_addr {
        opts.advertise_host = Some(addr);
    }

    let docker = DockerCli::new();
    let mut operator = ConsoleOperator {
        assume_yes: yes,
        remote: settings.remote,
    };
    let mut session = LinkSession::new(opts);
    session.run(&docker, &mut operator).await;
    report_outcome(&session);
    Ok(())
}

fn cmd_secure() -> Result<()> {
    let settings = Settings::load()?;
    let docker = DockerCli::new();
    if let Err(hint) = runtime::require_available(&docker) {
        anyhow::bail!("{}", hint);
    }

    let manager = ContainerManager::new(&docker);
    let opts = SessionOptions::from_settings(&settings);
    let spec = ContainerSpec {
        name: CONTAINER_NAME.to_string(),
        image: settings.image.clone(),
        bind: bind::decide(true),
        volume: settings.volume_dir(),
        mode: BridgeMode::Normal,
        post_link_mode: BridgeMode::JsonRpc,
    };

    info!("re-binding {} to loopback", CONTAINER_NAME);
    bind::secure(&manager, &spec)
        .map_err(|e| anyhow::anyhow!("failed to re-bind the bridge to loopback: {}", e))?;
    println!("✅ Bridge re-bound to loopback at {}", opts.accounts_url());
    Ok(())
}

fn cmd_status() -> Result<()> {
    let docker = DockerCli::new();
    match runtime::require_available(&docker) {
        Ok(()) => println!("✅ Container runtime available"),
        Err(hint) => {
            println!("❌ Container runtime unavailable\n{}", hint);
            return Ok(());
        }
    }

    let manager = ContainerManager::new(&docker);
    if manager.is_running(CONTAINER_NAME) {
        println!("✅ Bridge container '{}' is running", CONTAINER_NAME);
        let tail = manager.logs_tail(CONTAINER_NAME, 10);
        if !tail.is_empty() {
            println!("\nRecent log lines:");
            for line in tail {
                println!("   | {}", line);
            }
        }
    } else {
        println!("⚠️  Bridge container '{}' is not running", CONTAINER_NAME);
    }

    match Settings::load() {
        Ok(settings) => {
            println!("\nSettings: {}", Settings::path().display());
            let linked = settings.phone_number != settings::PLACEHOLDER_NUMBER;
            println!(
                "Number:   {}",
                if linked {
                    settings.phone_number.as_str()
                } else {
                    "(not yet linked)"
                }
            );
            println!("API:      {}", settings.api_base);
            println!("Image:    {}", settings.image);
        }
        Err(e) => error!("❌ Could not load settings: {}", e),
    }
    Ok(())
}

fn cmd_teardown() -> Result<()> {
    let docker = DockerCli::new();
    if let Err(hint) = runtime::require_available(&docker) {
        anyhow::bail!("{}", hint);
    }
    let manager = ContainerManager::new(&docker);
    manager.stop_existing(CONTAINER_NAME);
    println!("✅ Bridge container '{}' stopped and removed", CONTAINER_NAME);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(ref dir) = cli.config_dir {
        settings::set_config_dir(dir.clone());
    }

    let log_level = match &cli.command {
        Commands::Link { verbose, .. } => {
            if *verbose {
                "info"
            } else {
                "warn"
            }
        }
        _ => "info",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Link {
            remote,
            image,
            volume,
            device_name,
            advertise_addr,
            timeout,
            yes,
            verbose: _,
        } => cmd_link(remote, image, volume, device_name, advertise_addr, timeout, yes).await,
        Commands::Secure => cmd_secure(),
        Commands::Status => cmd_status(),
        Commands::Teardown => cmd_teardown(),
    }
}

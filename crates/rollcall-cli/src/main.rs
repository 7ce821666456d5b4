use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "io.rollcall.Attendance1",
    default_service = "io.rollcall.Attendance1",
    default_path = "/io/rollcall/Attendance1"
)]
trait Attendance {
    fn register(&self, identity: &str, image_path: &str) -> zbus::Result<u32>;
    fn start(&self) -> zbus::Result<()>;
    fn stop(&self) -> zbus::Result<()>;
    fn list_all(&self) -> zbus::Result<String>;
    fn export(&self, destination: &str) -> zbus::Result<u32>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face image for a person (the image is moved into the gallery)
    Register {
        /// Identity to record attendance under
        #[arg(short, long)]
        name: String,
        /// Image showing the person's face
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Start recognising faces from the camera
    Start,
    /// Stop recognition and release the camera
    Stop,
    /// List attendance entries
    List,
    /// Write the attendance ledger to a file
    Export {
        /// Destination CSV path
        destination: PathBuf,
    },
    /// Show daemon status
    Status,
    /// List local V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Device listing talks to the hardware directly, no daemon needed.
    if matches!(cli.command, Commands::Devices) {
        list_devices();
        return Ok(());
    }

    let proxy = connect(cli.system).await?;
    run(cli.command, &proxy).await
}

async fn connect(system: bool) -> Result<AttendanceProxy<'static>> {
    let connection = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    AttendanceProxy::new(&connection)
        .await
        .context("failed to reach rollcalld")
}

async fn run(command: Commands, proxy: &AttendanceProxy<'_>) -> Result<()> {
    match command {
        Commands::Register { name, image } => {
            let image = absolute(&image)?;
            let faces = proxy
                .register(&name, &image.to_string_lossy())
                .await
                .context("registration failed")?;
            println!("Registered {name}; gallery now holds {faces} face(s)");
        }
        Commands::Start => {
            proxy.start().await.context("failed to start recognition")?;
            println!("Recognition running");
        }
        Commands::Stop => {
            proxy.stop().await.context("failed to stop recognition")?;
            println!("Recognition stopped");
        }
        Commands::List => {
            let json = proxy.list_all().await.context("failed to list attendance")?;
            print_entries(&json)?;
        }
        Commands::Export { destination } => {
            let destination = absolute(&destination)?;
            let count = proxy
                .export(&destination.to_string_lossy())
                .await
                .context("export failed")?;
            println!("Exported {count} entries to {}", destination.display());
        }
        Commands::Status => {
            let json = proxy.status().await.context("failed to query status")?;
            let value: serde_json::Value = serde_json::from_str(&json).context("daemon returned invalid JSON")?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Devices => list_devices(),
    }

    Ok(())
}

/// The daemon resolves paths in its own working directory.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    Ok(cwd.join(path))
}

fn print_entries(json: &str) -> Result<()> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(json).context("daemon returned invalid JSON")?;
    if entries.is_empty() {
        println!("No attendance recorded");
        return Ok(());
    }
    println!("{:<24} {:<20} {:<20}", "Name", "Entry", "Exit");
    for entry in &entries {
        let name = entry["identity"].as_str().unwrap_or("-");
        let time = |key: &str| {
            entry[key]
                .as_str()
                .map_or_else(|| "-".to_string(), |t| t.replacen('T', " ", 1))
        };
        println!("{:<24} {:<20} {:<20}", name, time("entry"), time("exit"));
    }
    Ok(())
}

fn list_devices() {
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for dev in devices {
        println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon's camera session
    Start,
    /// Pause the camera session (the device stays open)
    Stop,
    /// Register the face currently in front of the camera
    Register {
        /// Name to store the samples under
        #[arg(short, long)]
        name: String,
    },
    /// Retrain the model from every registered sample
    Train,
    /// Mark attendance for the recognized face
    Mark,
    /// Show the latest recognition status
    Status,
    /// Save the latest annotated frame as JPEG
    Preview {
        #[arg(short, long, default_value = "preview.jpg")]
        output: PathBuf,
    },
    /// Save today's attendance report as PDF
    Report {
        #[arg(short, long, default_value = "attendance_report.pdf")]
        output: PathBuf,
    },
    /// List today's attendance
    Today,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// V4L2 device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Frames to capture
        #[arg(short, long, default_value_t = 5)]
        frames: usize,
    },
}

#[zbus::proxy(
    interface = "io.rollcall.Attendance1",
    default_service = "io.rollcall.Attendance1",
    default_path = "/io/rollcall/Attendance1"
)]
trait Attendance {
    async fn start_camera(&self) -> zbus::Result<(bool, String)>;
    async fn stop_camera(&self) -> zbus::Result<(bool, String)>;
    async fn register(&self, name: &str) -> zbus::Result<(bool, String)>;
    async fn train(&self) -> zbus::Result<(bool, String)>;
    async fn mark_attendance(&self) -> zbus::Result<(bool, String)>;
    async fn status(&self) -> zbus::Result<String>;
    async fn preview(&self) -> zbus::Result<Vec<u8>>;
    async fn todays_attendance(&self) -> zbus::Result<String>;
    async fn daily_report(&self) -> zbus::Result<Vec<u8>>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Test { device, frames } => camera_test(&device, frames),
        command => call_daemon(command).await,
    }
}

async fn call_daemon(command: Commands) -> Result<()> {
    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match command {
        Commands::Start => outcome(proxy.start_camera().await?)?,
        Commands::Stop => outcome(proxy.stop_camera().await?)?,
        Commands::Register { name } => outcome(proxy.register(&name).await?)?,
        Commands::Train => {
            println!("Training, this may take a while...");
            outcome(proxy.train().await?)?
        }
        Commands::Mark => outcome(proxy.mark_attendance().await?)?,
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("status:        {}", status["status"].as_str().unwrap_or("-"));
            println!("name:          {}", status["name"].as_str().unwrap_or("-"));
            println!("faces:         {}", status["faces"]);
            println!("camera active: {}", status["camera_active"]);
            println!(
                "model:         {}",
                status["model_version"].as_str().unwrap_or("not trained")
            );
        }
        Commands::Preview { output } => {
            let jpeg = proxy.preview().await?;
            if jpeg.is_empty() {
                bail!("no frame yet, start the camera first");
            }
            std::fs::write(&output, &jpeg)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Saved {} ({} bytes)", output.display(), jpeg.len());
        }
        Commands::Report { output } => {
            let pdf = proxy.daily_report().await?;
            std::fs::write(&output, &pdf)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Saved {} ({} bytes)", output.display(), pdf.len());
        }
        Commands::Today => {
            let records: Vec<serde_json::Value> =
                serde_json::from_str(&proxy.todays_attendance().await?)?;
            if records.is_empty() {
                println!("No attendance marked today");
            }
            for r in &records {
                println!(
                    "{:<24} {:<10} {}",
                    r["name"].as_str().unwrap_or("-"),
                    r["time"].as_str().unwrap_or("-"),
                    r["status"].as_str().unwrap_or("-"),
                );
            }
        }
        Commands::Test { device, frames } => camera_test(&device, frames)?,
    }

    Ok(())
}

/// Print a control reply; a failed operation becomes a non-zero exit.
fn outcome((success, message): (bool, String)) -> Result<()> {
    if success {
        println!("{message}");
        Ok(())
    } else {
        bail!(message)
    }
}

fn camera_test(device: &str, frames: usize) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {} - {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let mut camera = rollcall_hw::Camera::open(device, 640, 480)
        .with_context(|| format!("opening {device}"))?;
    camera.set_read_timeout(Duration::from_secs(2));
    println!(
        "Opened {} at {}x{} ({:?})",
        camera.device_path, camera.width, camera.height, camera.fourcc
    );

    for i in 0..frames {
        let frame = camera.capture_frame()?;
        println!(
            "frame {}: {}x{} seq={} brightness={:.1}",
            i + 1,
            frame.image.width(),
            frame.image.height(),
            frame.sequence,
            frame.avg_brightness()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_requires_name() {
        assert!(Cli::try_parse_from(["rollcall", "register"]).is_err());
        let cli = Cli::try_parse_from(["rollcall", "register", "--name", "alice"]).unwrap();
        assert!(matches!(cli.command, Commands::Register { name } if name == "alice"));
    }

    #[test]
    fn test_output_defaults() {
        let cli = Cli::try_parse_from(["rollcall", "report"]).unwrap();
        assert!(
            matches!(cli.command, Commands::Report { output } if output == PathBuf::from("attendance_report.pdf"))
        );
    }

    #[test]
    fn test_outcome() {
        assert!(outcome((true, "Camera started".into())).is_ok());
        let err = outcome((false, "No face detected".into())).unwrap_err();
        assert_eq!(err.to_string(), "No face detected");
    }
}

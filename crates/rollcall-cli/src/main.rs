use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn start(&self) -> zbus::Result<bool>;
    async fn stop(&self) -> zbus::Result<bool>;
    async fn enroll(&self, name: &str, external_id: &str) -> zbus::Result<String>;
    async fn remove(&self, record_id: i64) -> zbus::Result<bool>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn mark_attendance(&self) -> zbus::Result<String>;
    async fn list_attendance(&self, date: &str) -> zbus::Result<String>;
    async fn export_attendance(&self) -> zbus::Result<String>;
    async fn clear_attendance(&self) -> zbus::Result<u32>;
    async fn stats(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the camera and a new attendance session
    Start,
    /// Stop the camera and end the session
    Stop,
    /// Enroll the person currently in front of the camera
    Enroll {
        /// Display name
        #[arg(short, long)]
        name: String,
        /// External ID (student or employee number)
        #[arg(short, long, default_value = "")]
        id: String,
    },
    /// Remove an enrolled person by record ID
    Remove {
        /// Record ID, as shown by `rollcall list`
        id: i64,
    },
    /// List enrolled people
    List,
    /// Mark attendance for the person currently recognized
    Mark,
    /// Show attendance for a day (default: today)
    Attendance {
        /// Day in the form "Mon Jan 01 2024"
        #[arg(short, long, default_value = "")]
        date: String,
    },
    /// Export all attendance as CSV
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete all attendance records
    Clear,
    /// Show today's attendance figures
    Stats,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("could not connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Start => {
            if proxy.start().await? {
                println!("Camera started");
            } else {
                println!("Camera already running");
            }
        }
        Commands::Stop => {
            if proxy.stop().await? {
                println!("Camera stopped");
            } else {
                println!("Camera was not running");
            }
        }
        Commands::Enroll { name, id } => {
            println!("Enrolling {name}; look at the camera...");
            let reply: Value = serde_json::from_str(&proxy.enroll(&name, &id).await?)?;
            println!(
                "Enrolled {} (record {})",
                field(&reply, "displayName"),
                field(&reply, "recordId")
            );
        }
        Commands::Remove { id } => {
            if proxy.remove(id).await? {
                println!("Removed record {id}");
            } else {
                println!("No record with ID {id}");
            }
        }
        Commands::List => {
            let identities: Vec<Value> = serde_json::from_str(&proxy.list_identities().await?)?;
            if identities.is_empty() {
                println!("Nobody enrolled");
            }
            for i in &identities {
                let face = if i["hasFaceData"].as_bool().unwrap_or(false) {
                    ""
                } else {
                    "  (no face data)"
                };
                println!(
                    "{:>6}  {:<24} {:<12} {}{face}",
                    field(i, "recordId"),
                    field(i, "displayName"),
                    field(i, "externalId"),
                    field(i, "enrolledAt"),
                );
            }
        }
        Commands::Mark => {
            let reply: Value = serde_json::from_str(&proxy.mark_attendance().await?)?;
            if reply["marked"].as_bool().unwrap_or(false) {
                let record = &reply["record"];
                println!(
                    "Marked {} ({}) at {}",
                    field(record, "displayName"),
                    field(record, "externalId"),
                    field(record, "time")
                );
            } else {
                println!("Not marked: {}", field(&reply, "message"));
            }
        }
        Commands::Attendance { date } => {
            let records: Vec<Value> = serde_json::from_str(&proxy.list_attendance(&date).await?)?;
            if records.is_empty() {
                println!("No attendance recorded");
            }
            for r in &records {
                println!(
                    "{:<12} {:<24} {:<12} {}",
                    field(r, "time"),
                    field(r, "displayName"),
                    field(r, "externalId"),
                    field(r, "date"),
                );
            }
        }
        Commands::Export { output } => {
            let csv = proxy.export_attendance().await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, csv)
                        .with_context(|| format!("could not write {}", path.display()))?;
                    println!("Wrote {}", path.display());
                }
                None => print!("{csv}"),
            }
        }
        Commands::Clear => {
            let removed = proxy.clear_attendance().await?;
            println!("Removed {removed} attendance records");
        }
        Commands::Stats => {
            let stats: Value = serde_json::from_str(&proxy.stats().await?)?;
            println!("Enrolled: {}", field(&stats, "enrolled"));
            println!("Present:  {}", field(&stats, "present"));
            println!("Rate:     {}%", field(&stats, "ratePercent"));
        }
        Commands::Status => {
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

/// Render a JSON field for display; strings lose their quotes.
fn field(value: &Value, key: &str) -> String {
    match &value[key] {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_enroll_args() {
        let cli = Cli::parse_from(["rollcall", "enroll", "--name", "Priya", "--id", "US001"]);
        match cli.command {
            Commands::Enroll { name, id } => assert_eq!((name.as_str(), id.as_str()), ("Priya", "US001")),
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_field_rendering() {
        let v = serde_json::json!({ "name": "Asha", "id": 7, "gone": null });
        assert_eq!(field(&v, "name"), "Asha");
        assert_eq!(field(&v, "id"), "7");
        assert_eq!(field(&v, "gone"), "-");
        assert_eq!(field(&v, "missing"), "-");
    }
}

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Local};
use warden::daemon::{ControlClient, Request, Response};

fn client(config_flag: Option<&Path>) -> Result<ControlClient> {
    let config = super::load_config(config_flag)?;
    Ok(ControlClient::new(config.socket_path()))
}

/// Sends `request`, turning an error response into an `Err`.
async fn call(config_flag: Option<&Path>, request: Request) -> Result<Response> {
    match client(config_flag)?.request(&request).await? {
        Response::Error { kind, message } => anyhow::bail!("{} ({})", message, kind),
        response => Ok(response),
    }
}

async fn expect_ok(config_flag: Option<&Path>, request: Request, done: &str) -> Result<()> {
    match call(config_flag, request).await? {
        Response::Ok => {
            println!("{}", done);
            Ok(())
        }
        other => anyhow::bail!("Unexpected response: {:?}", other),
    }
}

pub(crate) async fn cmd_status(config_flag: Option<&Path>) -> Result<()> {
    let client = client(config_flag)?;
    let (uptime, version) = client.ping().await?;
    println!("Warden v{} (uptime: {})", version, format_duration(uptime.as_secs()));
    println!();

    let Response::Services { list } = client.request(&Request::ListServices).await? else {
        anyhow::bail!("Unexpected response to service listing");
    };
    println!("{:<10} {:<10} {:<8} {:<9} DEPENDS ON", "SERVICE", "STATE", "PID", "RESTARTS");
    for info in list {
        let pid = info.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        let deps = if info.depends_on.is_empty() {
            "-".to_string()
        } else {
            info.depends_on.join(", ")
        };
        println!(
            "{:<10} {:<10} {:<8} {:<9} {}",
            info.name,
            info.state.as_str(),
            pid,
            info.restarts,
            deps
        );
    }
    Ok(())
}

pub(crate) async fn cmd_start(config_flag: Option<&Path>) -> Result<()> {
    expect_ok(config_flag, Request::StartAll, "All services started").await
}

pub(crate) async fn cmd_stop(config_flag: Option<&Path>) -> Result<()> {
    expect_ok(config_flag, Request::StopAll, "All services stopped").await
}

pub(crate) async fn cmd_shutdown(config_flag: Option<&Path>) -> Result<()> {
    expect_ok(config_flag, Request::Shutdown, "Warden is shutting down").await
}

pub(crate) async fn cmd_reset(config_flag: Option<&Path>) -> Result<()> {
    expect_ok(
        config_flag,
        Request::ResetProcess,
        "Server process reset, run `warden start` to launch it",
    )
    .await
}

pub(crate) async fn cmd_rcon(config_flag: Option<&Path>, command: &str) -> Result<()> {
    let request = Request::Rcon {
        command: command.to_string(),
    };
    match call(config_flag, request).await? {
        Response::RconReply { response } => {
            if !response.is_empty() {
                println!("{}", response);
            }
            Ok(())
        }
        other => anyhow::bail!("Unexpected response: {:?}", other),
    }
}

pub(crate) async fn cmd_logs(config_flag: Option<&Path>, source: &str, lines: u32) -> Result<()> {
    let request = Request::Logs {
        source: source.to_string(),
        lines,
    };
    let Response::Logs { lines, .. } = call(config_flag, request).await? else {
        anyhow::bail!("Unexpected response to log request");
    };
    for line in lines {
        let ts = DateTime::from_timestamp_millis(line.timestamp_ms)
            .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
            .unwrap_or_default();
        println!("{} {}", ts, line.line);
    }
    Ok(())
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_are_compact() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(7260), "2h 1m");
    }
}

use anyhow::{bail, Context as _};
use serde_json::Value;
use std::time::Duration;

use svcmgr::daemon::{
    DaemonStatus, RpcClient, ServiceRecord, ServiceSnapshot, StartOutcome, StopOutcome,
};

use super::{format_uptime, Context};

pub(crate) async fn cmd_list(ctx: &Context) -> anyhow::Result<()> {
    let records = ctx.scanner().list_services().await?;

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No services installed in {}", ctx.root.path().display());
        return Ok(());
    }

    print_table(&records);
    let summary = svcmgr::daemon::HealthSummary::from_records(&records);
    println!();
    println!(
        "{} services: {} running, {} stopped, {} degraded",
        summary.total, summary.running, summary.stopped, summary.degraded
    );
    Ok(())
}

pub(crate) async fn cmd_health(ctx: &Context, name: &str) -> anyhow::Result<()> {
    let report = ctx.scanner().health_report(name).await?;

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}: {}", name, report.status);
    if let Some(version) = &report.version {
        println!("  version: {}", version);
    }
    if let Some(uptime) = report.uptime_seconds {
        println!("  uptime:  {}", format_uptime(uptime));
    }
    if !report.dependencies.is_empty() {
        println!("  dependencies:");
        for (dep, health) in &report.dependencies {
            let mark = if health.ok { "ok" } else { "FAIL" };
            let mut line = format!("    {:<16} {}", dep, mark);
            if let Some(ms) = health.latency_ms {
                line.push_str(&format!(" ({:.1}ms)", ms));
            }
            if let Some(message) = &health.message {
                line.push_str(&format!(" {}", message));
            }
            println!("{}", line);
        }
    }
    Ok(())
}

pub(crate) async fn cmd_start(ctx: &Context, name: &str) -> anyhow::Result<()> {
    match ctx.supervisor().start(name).await? {
        StartOutcome::AlreadyRunning => println!("{} is already running", name),
        StartOutcome::Started { pid: Some(pid) } => println!("Started {} (pid {})", name, pid),
        StartOutcome::Started { pid: None } => println!("Started {}", name),
    }
    Ok(())
}

pub(crate) async fn cmd_stop(ctx: &Context, name: &str) -> anyhow::Result<()> {
    match ctx.supervisor().stop(name).await? {
        StopOutcome::Graceful => println!("Stopped {}", name),
        StopOutcome::Terminated { pid, exited: true } => {
            println!("Stopped {} (sent SIGTERM to pid {})", name, pid)
        }
        StopOutcome::Terminated { pid, exited: false } => {
            println!("Sent SIGTERM to {} (pid {}), still exiting", name, pid)
        }
        StopOutcome::Cleaned => println!("{} was not running, cleaned up stale files", name),
    }
    Ok(())
}

pub(crate) async fn cmd_restart(ctx: &Context, name: &str) -> anyhow::Result<()> {
    ctx.supervisor().restart(name).await?;
    println!("Restarted {}", name);
    Ok(())
}

pub(crate) async fn cmd_toggle(ctx: &Context, name: &str) -> anyhow::Result<()> {
    let monitor = ctx.monitor();
    let record = ctx.scanner().probe(name).await?;
    monitor.toggle(&record).await?;

    let status = monitor
        .snapshot()
        .service(name)
        .map(|r| r.status)
        .unwrap_or(DaemonStatus::Stopped);
    println!("{}: {} -> {}", name, record.status, status);
    Ok(())
}

pub(crate) async fn cmd_call(
    ctx: &Context,
    name: &str,
    method: &str,
    params: &str,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let params: Value = serde_json::from_str(params).context("--params is not valid JSON")?;
    let Value::Object(params) = params else {
        bail!("--params must be a JSON object");
    };
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or(ctx.settings.rpc_timeout);

    let result = ctx.scanner().call(name, method, params, timeout).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

pub(crate) async fn cmd_methods(ctx: &Context, name: &str) -> anyhow::Result<()> {
    let paths = ctx.root.paths(name)?;
    let result = RpcClient::new(&paths.socket)
        .with_timeout(ctx.settings.rpc_timeout)
        .methods()
        .await?
        .into_result()?;

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let methods = result
        .get("methods")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if methods.is_empty() {
        println!("{} exposes no methods", name);
        return Ok(());
    }
    for method in &methods {
        let method_name = method.get("name").and_then(Value::as_str).unwrap_or("?");
        let description = method
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("");
        println!("  {:<28} {}", method_name, description);
    }
    Ok(())
}

pub(crate) async fn cmd_watch(ctx: &Context) -> anyhow::Result<()> {
    let monitor = ctx.monitor();
    let mut updates = monitor.subscribe();
    let handle = monitor.spawn();

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                render_snapshot(&snapshot);
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    monitor.stop();
    handle.await?;
    Ok(())
}

fn render_snapshot(snapshot: &ServiceSnapshot) {
    // Clear screen and home the cursor
    print!("\x1b[2J\x1b[H");
    println!("overall: {:?}", snapshot.overall());
    if let Some(err) = &snapshot.list_error {
        println!("listing failed: {}", err);
    }
    println!();
    print_table(&snapshot.services);
    for (service, err) in &snapshot.action_errors {
        println!("{}: {}", service, err);
    }
}

fn print_table(records: &[ServiceRecord]) {
    println!("{:<24} {:<16} {:<12} {}", "SERVICE", "STATUS", "VERSION", "UPTIME");
    for record in records {
        let status = if record.has_manifest {
            record.status.to_string()
        } else {
            format!("{} (no manifest)", record.status)
        };
        println!(
            "{:<24} {:<16} {:<12} {}",
            record.name,
            status,
            record.version.as_deref().unwrap_or("-"),
            record.uptime_seconds.map(format_uptime).unwrap_or_else(|| "-".into()),
        );
    }
}

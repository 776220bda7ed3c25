use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use svcmgr::registry::{current_platform, list_annotated};
use svcmgr::InstallProgress;

use super::Context;

pub(crate) fn cmd_packages(ctx: &Context) -> anyhow::Result<()> {
    let packages = list_annotated(&ctx.registry(), &ctx.root)?;

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&packages)?);
        return Ok(());
    }

    if packages.is_empty() {
        println!("Registry is empty");
        return Ok(());
    }

    let platform = current_platform();
    println!(
        "{:<24} {:<10} {:<12} {:<8} {}",
        "PACKAGE", "VERSION", "INSTALLED", "SOURCE", "DESCRIPTION"
    );
    for package in &packages {
        let installed = match (&package.installed_version, package.update_available) {
            (Some(v), true) => format!("{} *", v),
            (Some(v), false) => v.clone(),
            (None, _) if package.installed => "yes".into(),
            (None, _) => "-".into(),
        };
        let source = if package.artifact_for(&platform).is_some() {
            "binary"
        } else if package.repository.is_some() {
            "source"
        } else {
            "-"
        };
        println!(
            "{:<24} {:<10} {:<12} {:<8} {}",
            package.name, package.version, installed, source, package.description
        );
    }
    if packages.iter().any(|p| p.update_available) {
        println!();
        println!("* update available");
    }
    Ok(())
}

pub(crate) async fn cmd_install(ctx: &Context, name: &str) -> anyhow::Result<()> {
    let installer = ctx.installer();
    let (tx, mut rx) = mpsc::unbounded_channel::<InstallProgress>();

    let pb = create_progress_bar();
    let drain = {
        let pb = pb.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                pb.set_length(u64::from(event.total));
                pb.set_position(u64::from(event.progress));
                pb.set_message(format!("{}: {}", event.package, event.step));
            }
        })
    };

    let result = installer.install_package(name, &tx).await;
    drop(tx);
    drain.await?;

    match &result {
        Ok(()) => pb.finish_with_message(format!("{} installed successfully", name)),
        Err(e) => pb.abandon_with_message(format!("Failed: {}", e)),
    }
    result?;
    Ok(())
}

pub(crate) async fn cmd_uninstall(ctx: &Context, name: &str) -> anyhow::Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Uninstalling {}", name));
    pb.enable_steady_tick(std::time::Duration::from_millis(100));

    let result = ctx.installer().uninstall_package(name).await;
    match &result {
        Ok(()) => pb.finish_with_message(format!("{} uninstalled successfully", name)),
        Err(e) => pb.abandon_with_message(format!("Failed: {}", e)),
    }
    result?;
    Ok(())
}

fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{bar:30.green/white} {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

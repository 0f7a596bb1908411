use anyhow::{Context, Result};
use colored::Colorize;
use dialoguer::Confirm;
use walcast_config::WalcastConfig;
use walcast_core::format_lsn;
use walcast_pg::{connect_control, drop_slot, list_slots, slot_exists, PgError, SlotInfo};

pub async fn cmd_slots_list(config: &WalcastConfig) -> Result<()> {
    let client = connect_control(&config.postgres.connection_string)
        .await
        .context("Failed to connect to Postgres")?;

    let slots = list_slots(&client, &config.slot.prefix).await?;
    if slots.is_empty() {
        println!("No replication slots with prefix '{}'.", config.slot.prefix);
        return Ok(());
    }

    println!(
        "\n{:<40} {:<12} {:<10} {:>18}",
        "Slot", "Plugin", "Active", "Confirmed LSN"
    );
    println!("{:-<83}", "");
    for slot in &slots {
        println!("{}", format_slot_row(slot));
    }
    println!();

    Ok(())
}

pub async fn cmd_slots_drop(config: &WalcastConfig, name: &str) -> Result<()> {
    let client = connect_control(&config.postgres.connection_string)
        .await
        .context("Failed to connect to Postgres")?;

    if !slot_exists(&client, name).await? {
        return Err(PgError::SlotNotFound(name.to_string()).into());
    }

    drop_slot(&client, name).await?;
    println!("{} {}", "Dropped".green(), name);
    Ok(())
}

/// Drop inactive slots left behind by runs that never reached shutdown.
pub async fn cmd_slots_prune(config: &WalcastConfig, yes: bool) -> Result<()> {
    let client = connect_control(&config.postgres.connection_string)
        .await
        .context("Failed to connect to Postgres")?;

    let orphans: Vec<SlotInfo> = list_slots(&client, &config.slot.prefix)
        .await?
        .into_iter()
        .filter(|slot| !slot.active)
        .collect();

    if orphans.is_empty() {
        println!("No inactive slots with prefix '{}'.", config.slot.prefix);
        return Ok(());
    }

    println!("{}", "Inactive replication slots retain WAL on the server:".yellow());
    for slot in &orphans {
        println!("  • {}", slot.name);
    }
    println!();

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!("Drop {} slot(s)?", orphans.len()))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    let mut failed = 0;
    for slot in &orphans {
        match drop_slot(&client, &slot.name).await {
            Ok(()) => println!("  {} {}", "✓".green(), slot.name),
            Err(e) => {
                failed += 1;
                eprintln!("  {} {}: {}", "✗".red(), slot.name, e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} slot(s) could not be dropped", failed);
    }
    Ok(())
}

fn format_slot_row(slot: &SlotInfo) -> String {
    let active = if slot.active {
        "yes".green()
    } else {
        "no".yellow()
    };

    format!(
        "{:<40} {:<12} {:<10} {:>18}",
        slot.name,
        slot.plugin.as_deref().unwrap_or("-"),
        active,
        slot.confirmed_flush_lsn
            .map(format_lsn)
            .unwrap_or_else(|| "-".to_string())
    )
}

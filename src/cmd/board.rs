//! Board, inbox and connection commands backed by `LeadBoard`.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use zapboard::board::models::{BoardView, DashboardStats, PlanUsage, Principal};
use zapboard::board::service::OutgoingMessage;
use zapboard::board::sync::spawn_stats_poller;
use zapboard::board::uploads::Attachment;
use zapboard::config::ZapboardConfig;

use super::super::{BoardCommands, ConnectionCommands};
use super::{flush_notifications, open_board};

pub async fn cmd_board(config: &ZapboardConfig, command: BoardCommands) -> Result<()> {
    let board = open_board(config)?;

    match command {
        BoardCommands::Show { user } => {
            let view = board.board(&Principal::new(user)).await?;
            print_board(&view);
        }
        BoardCommands::Move {
            user,
            lead,
            column,
            index,
        } => {
            let user = Principal::new(user);
            let moved = board.move_lead(&user, lead, column, index).await?;
            flush_notifications(&board, &user);
            println!(
                "Lead #{} is now in column #{} at position {}",
                moved.id, moved.column_id, moved.position
            );
        }
        BoardCommands::Convert { user, leads, list } => {
            let user = Principal::new(user);
            let report = board
                .convert_leads_to_contacts(&user, &leads, &list)
                .await?;
            flush_notifications(&board, &user);
            println!(
                "List '{}' (#{}): {} contacts, {} members, {} skipped without phone",
                report.list.name,
                report.list.id,
                report.contacts_created,
                report.members_created,
                report.skipped_without_phone
            );
        }
    }

    Ok(())
}

pub async fn cmd_send(
    config: &ZapboardConfig,
    user: &str,
    conversation_id: i64,
    instance: &str,
    body: &str,
    attach: Option<&Path>,
) -> Result<()> {
    let attachment = attach.map(describe_file).transpose()?;
    let board = open_board(config)?;
    let user = Principal::new(user);

    let message = board
        .send_message(
            &user,
            OutgoingMessage {
                instance: instance.to_string(),
                conversation_id,
                body: body.to_string(),
                attachment,
            },
        )
        .await?;
    flush_notifications(&board, &user);
    println!("Recorded message #{} ({})", message.id, message.status);
    if let Some(url) = &message.media_url {
        println!("Media: {}", url);
    }
    Ok(())
}

fn describe_file(path: &Path) -> Result<Attachment> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("Failed to read attachment: {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(Attachment {
        file_name,
        content_type: None,
        size: meta.len(),
    })
}

pub async fn cmd_connection(config: &ZapboardConfig, command: ConnectionCommands) -> Result<()> {
    let board = open_board(config)?;

    let (user, reply) = match command {
        ConnectionCommands::Create { user, instance } => {
            let user = Principal::new(user);
            let reply = board.create_connection(&user, &instance).await?;
            (user, reply)
        }
        ConnectionCommands::Delete { user, instance } => {
            let user = Principal::new(user);
            let reply = board.delete_connection(&user, &instance).await?;
            (user, reply)
        }
        ConnectionCommands::Qr { user, instance } => {
            let user = Principal::new(user);
            let reply = board.generate_qr_code(&user, &instance).await?;
            (user, reply)
        }
    };
    flush_notifications(&board, &user);
    if !reply.is_null() {
        println!("{}", serde_json::to_string_pretty(&reply)?);
    }
    Ok(())
}

pub async fn cmd_stats(config: &ZapboardConfig, user: &str, watch: bool) -> Result<()> {
    let board = open_board(config)?;
    let principal = Principal::new(user);

    print_stats(
        &board.stats(&principal).await?,
        &board.plan_usage(&principal).await?,
    );
    if !watch {
        return Ok(());
    }

    let every = config.stats_poll_interval();
    let _poller = spawn_stats_poller(
        Arc::clone(board.cache()),
        principal.user_id.clone(),
        every,
    );
    // Read just after each invalidation.
    let start = tokio::time::Instant::now() + every + std::time::Duration::from_millis(250);
    let mut ticker = tokio::time::interval_at(start, every);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                println!();
                print_stats(
                    &board.stats(&principal).await?,
                    &board.plan_usage(&principal).await?,
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn print_board(view: &BoardView) {
    for column in &view.columns {
        let marker = if column.column.is_default { " (default)" } else { "" };
        println!(
            "== {}{} [#{}] - {} leads",
            column.column.name,
            marker,
            column.column.id,
            column.leads.len()
        );
        for lead in &column.leads {
            let phone = lead.phone.as_deref().unwrap_or("-");
            match lead.value {
                Some(value) => println!("  #{:<5} {:<24} {:<16} {:.2}", lead.id, lead.name, phone, value),
                None => println!("  #{:<5} {:<24} {}", lead.id, lead.name, phone),
            }
        }
    }
}

fn print_stats(stats: &DashboardStats, usage: &PlanUsage) {
    println!("Leads:           {}", stats.leads);
    println!("Contacts:        {}", stats.contacts);
    println!("Conversations:   {}", stats.conversations);
    println!("Unread messages: {}", stats.unread_messages);
    println!("Messages sent:   {}", stats.messages_sent);
    println!(
        "Plan: {:?} ({}/{} messages, {}/{} connections)",
        usage.plan,
        usage.messages_used,
        usage.messages_limit,
        usage.connections_used,
        usage.connections_limit
    );
    println!("Messages left:   {}", usage.messages_remaining());
}

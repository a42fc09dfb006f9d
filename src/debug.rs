use crate::protocol::{Command, WorldChange};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);
static TRACE_MODE: AtomicBool = AtomicBool::new(false);

/// Initialize debug mode from environment variables
///
/// - `WORLDSYNC_DEBUG=1`: log every command as JSON
/// - `WORLDSYNC_TRACE=1`: log a one-line trace of every send and receive
pub fn init_debug_mode() {
    let debug = env::var("WORLDSYNC_DEBUG").is_ok();
    let trace = env::var("WORLDSYNC_TRACE").is_ok();

    DEBUG_MODE.store(debug, Ordering::Relaxed);
    TRACE_MODE.store(trace, Ordering::Relaxed);

    if debug {
        tracing::info!("Debug mode enabled - all commands will be logged as JSON");
    }

    if trace {
        tracing::info!("Trace mode enabled - transport traffic will be logged");
    }
}

pub fn is_debug_enabled() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

pub fn is_trace_enabled() -> bool {
    TRACE_MODE.load(Ordering::Relaxed)
}

/// Log a command in JSON format if debug mode is enabled
pub fn log_command(direction: &str, command: &Command) {
    if !is_debug_enabled() {
        return;
    }

    match serde_json::to_string_pretty(command) {
        Ok(json) => tracing::debug!("{} {}:\n{}", direction, command.command_type(), json),
        Err(e) => tracing::debug!("Failed to serialize command to JSON: {}", e),
    }
}

pub fn trace_transport_send(bytes: usize, destination: &str) {
    if !is_trace_enabled() {
        return;
    }

    tracing::trace!("→ Sent {} to {}", format_bytes(bytes), destination);
}

pub fn trace_transport_receive(bytes: usize, source: &str) {
    if !is_trace_enabled() {
        return;
    }

    tracing::trace!("← Received {} from {}", format_bytes(bytes), source);
}

/// Format bytes in human-readable format (KB, MB, etc.)
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// One-line description of a command for log output.
pub fn command_summary(command: &Command) -> String {
    match command {
        Command::ConnectionRequest(req) => {
            format!("ConnectionRequest ({} v{})", req.username, req.protocol_version)
        }
        Command::ConnectionResult(res) if res.success => "ConnectionResult (accepted)".to_string(),
        Command::ConnectionResult(res) => format!(
            "ConnectionResult (refused: {})",
            res.reason.as_deref().unwrap_or("no reason")
        ),
        Command::ConnectionClose(close) => format!("ConnectionClose ({})", close.reason),
        Command::Ping(ping) => format!("Ping (t: {})", ping.timestamp_millis),
        Command::Pong(pong) => format!("Pong (t: {})", pong.timestamp_millis),
        Command::WorldTransfer(chunk) => format!(
            "WorldTransfer ({}/{}, {})",
            chunk.index + 1,
            chunk.count,
            format_bytes(chunk.chunk.len())
        ),
        Command::PlayerJoined(joined) => format!("PlayerJoined ({})", joined.username),
        Command::PlayerLeft(left) => format!("PlayerLeft ({}: {})", left.username, left.reason),
        Command::Change(WorldChange::EntityCreate(create)) => format!(
            "EntityCreate (info {}, {} ids)",
            create.info_index,
            create.array16_ids.len() + create.array32_ids.len()
        ),
        Command::Change(WorldChange::EntityRemove(remove)) => {
            format!("EntityRemove (entity {})", remove.entity_id)
        }
        Command::Change(WorldChange::Custom(custom)) => format!(
            "CustomChange (channel {}, {})",
            custom.channel,
            format_bytes(custom.payload.len())
        ),
    }
}

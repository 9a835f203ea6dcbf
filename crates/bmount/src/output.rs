use std::sync::OnceLock;

use anyhow::Result;
use bmount_core::{MountState, MountTarget, TargetHealth};
use clap::ColorChoice;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, Table};
use serde::Serialize;

static COLOR: OnceLock<ColorChoice> = OnceLock::new();

/// Record the `--color` choice for tables created later.
pub fn set_color(choice: ColorChoice) {
    let _ = COLOR.set(choice);
}

/// Create a styled table for output
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS);
    match COLOR.get() {
        Some(ColorChoice::Always) => {
            table.enforce_styling();
        }
        Some(ColorChoice::Never) => {
            table.force_no_tty();
        }
        _ => {}
    }
    table
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Display form of an optional target.
pub fn format_target(target: Option<&MountTarget>) -> String {
    target.map_or_else(|| "-".to_string(), ToString::to_string)
}

/// Colored cell for a session state.
pub fn state_cell(state: MountState) -> Cell {
    let (label, color) = match state {
        MountState::Unmounted => ("unmounted", Color::White),
        MountState::Mounting => ("mounting", Color::Yellow),
        MountState::Mounted => ("mounted", Color::Green),
        MountState::Stale => ("stale", Color::Red),
        MountState::Unmounting => ("unmounting", Color::Yellow),
        MountState::Busy => ("busy", Color::Magenta),
    };
    Cell::new(label).fg(color)
}

/// Label for a live health probe.
pub fn health_label(health: Option<TargetHealth>) -> &'static str {
    match health {
        None => "-",
        Some(TargetHealth::Absent) => "absent",
        Some(TargetHealth::Unmounted) => "not mounted",
        Some(TargetHealth::Healthy) => "healthy",
        Some(TargetHealth::Stale) => "stale",
    }
}

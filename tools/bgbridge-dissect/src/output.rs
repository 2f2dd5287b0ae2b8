//! Output formatting for dissected frames.

use bgbridge::bglib::ChipMessage;
use colored::Colorize;

use crate::capture::Direction;
use crate::dissect::{Content, Dissected};

/// Gray for raw hex lines.
fn gray_hex(text: &str) -> colored::ColoredString {
    text.truecolor(128, 128, 128)
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub show_raw_hex: bool,
    pub use_color: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            show_raw_hex: false,
            use_color: true,
        }
    }
}

fn direction_color(direction: Direction) -> colored::Color {
    match direction {
        Direction::App => colored::Color::BrightCyan,
        Direction::Chip => colored::Color::BrightYellow,
    }
}

fn format_timestamp(timestamp: Option<f64>) -> String {
    match timestamp {
        Some(t) => format!("{:>12.6}", t),
        None => format!("{:>12}", "-"),
    }
}

fn describe_message(message: &ChipMessage) -> Option<String> {
    match message {
        ChipMessage::BtAddress(mac) => Some(format!("address {}", mac)),
        ChipMessage::Boot(version) => Some(format!("firmware {}", version)),
        ChipMessage::ExtendedScanSet => Some("extended scan set".into()),
        ChipMessage::DiscoveryStarted => Some("discovery started".into()),
        ChipMessage::ScanResponse => Some("unparsable scan response".into()),
        ChipMessage::Other => None,
    }
}

fn describe(content: &Content, config: &OutputConfig) -> String {
    match content {
        Content::Frame { header, message } => {
            let name = header.map_or_else(|| "frame".to_string(), |h| h.to_string());
            match message.as_ref().and_then(describe_message) {
                Some(detail) => format!("{} ({})", name, detail),
                None => name,
            }
        }
        Content::Advertisement(adv) => {
            let json = serde_json::to_string(adv.as_ref())
                .unwrap_or_else(|e| format!("<unserializable: {}>", e));
            format!("advertisement {}", json)
        }
        Content::Wrong(reason) => {
            let text = format!("wrong: {}", reason);
            if config.use_color {
                text.red().to_string()
            } else {
                text
            }
        }
    }
}

/// Hex dump, 16 bytes per line.
fn format_hex_multiline(data: &[u8]) -> String {
    data.chunks(16)
        .map(|line| {
            line.iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_dissected(item: &Dissected, config: &OutputConfig) -> String {
    let direction = item.direction.to_string();
    let direction = if config.use_color {
        direction.color(direction_color(item.direction)).to_string()
    } else {
        direction
    };

    let mut result = format!(
        "{} {}: {}",
        format_timestamp(item.timestamp),
        direction,
        describe(&item.content, config)
    );

    if config.show_raw_hex && !item.raw.is_empty() {
        for line in format_hex_multiline(&item.raw).lines() {
            result.push_str("\n        ");
            if config.use_color {
                result.push_str(&gray_hex(line).to_string());
            } else {
                result.push_str(line);
            }
        }
    }

    result
}

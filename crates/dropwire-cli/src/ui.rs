//! UI utilities for Dropwire CLI.

use dropwire_core::file::format_size;
use dropwire_core::transfer::{TransferDirection, TransferStatus, TransferView};

const BOX_WIDTH: usize = 37;
const BAR_WIDTH: usize = 24;

/// A formatted box announcing a hosted room.
pub struct RoomBox<'a> {
    address: &'a str,
    files: usize,
}

impl<'a> RoomBox<'a> {
    /// Create a new room box.
    #[must_use]
    pub const fn new(address: &'a str) -> Self {
        Self { address, files: 0 }
    }

    /// Mention how many files are waiting to be sent.
    #[must_use]
    pub const fn with_files(mut self, files: usize) -> Self {
        self.files = files;
        self
    }

    /// Display the room box to stdout.
    pub fn display(&self) {
        let room_line = format!("Room:  {}", self.address);

        println!("  ┌{}┐", "─".repeat(BOX_WIDTH));
        println!("  │{}│", " ".repeat(BOX_WIDTH));
        println!("  │{}│", center_in_box(&room_line, BOX_WIDTH));
        println!("  │{}│", " ".repeat(BOX_WIDTH));

        if self.files > 0 {
            let files_line = format!("{} file(s) ready to send", self.files);
            println!("  │{}│", center_in_box(&files_line, BOX_WIDTH));
            println!("  │{}│", " ".repeat(BOX_WIDTH));
        }

        println!("  └{}┘", "─".repeat(BOX_WIDTH));
    }
}

fn center_in_box(content: &str, width: usize) -> String {
    let content_len = content.chars().count();
    let padding = width.saturating_sub(content_len);
    let left = padding / 2;
    let right = padding - left;
    format!("{}{}{}", " ".repeat(left), content, " ".repeat(right))
}

/// Render a fixed-width progress bar.
pub fn progress_bar(progress: u8, width: usize) -> String {
    let filled = width * usize::from(progress.min(100)) / 100;
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

/// One status line for a transfer.
pub fn transfer_line(view: &TransferView) -> String {
    let arrow = match view.direction {
        TransferDirection::Outbound => "↑",
        TransferDirection::Inbound => "↓",
    };

    match view.status {
        TransferStatus::Complete => format!(
            "{} {} ({}) complete",
            arrow,
            view.name,
            format_size(view.size)
        ),
        TransferStatus::Error => format!(
            "{} {} failed: {}",
            arrow,
            view.name,
            view.error.as_deref().unwrap_or("unknown error")
        ),
        TransferStatus::Pending | TransferStatus::Sending | TransferStatus::Receiving => format!(
            "{} {} [{}] {:>3}%",
            arrow,
            view.name,
            progress_bar(view.progress, BAR_WIDTH),
            view.progress
        ),
    }
}

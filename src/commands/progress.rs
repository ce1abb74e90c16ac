//! Progress bars for flash operations

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use mcuflash_core::flash::{FlashObserver, WriteStats};
use std::time::Duration;

/// Progress reporter using indicatif progress bars
pub struct IndicatifProgress {
    multi: MultiProgress,
    current_bar: Option<ProgressBar>,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            current_bar: None,
        }
    }

    fn create_bar(&mut self, total: u64, phase: &'static str) {
        self.finish_current();
        let pb = self.multi.add(ProgressBar::new(total));
        pb.set_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {}",
                    phase
                ))
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        self.current_bar = Some(pb);
    }

    fn create_spinner(&mut self, message: String) {
        self.finish_current();
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(100));
        self.current_bar = Some(pb);
    }

    fn finish_current(&mut self) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish();
        }
    }

    fn finish(&mut self, message: &str) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish_with_message(message.to_string());
        }
    }
}

impl FlashObserver for IndicatifProgress {
    fn reading(&mut self, total_bytes: usize) {
        self.create_bar(total_bytes as u64, "Reading");
    }

    fn read_progress(&mut self, bytes_read: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(bytes_read as u64);
        }
    }

    fn erasing(&mut self, sectors_to_erase: usize) {
        self.create_spinner(format!("Erasing {} sectors...", sectors_to_erase));
    }

    fn erase_progress(&mut self, sectors_erased: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_message(format!("Erased {} sectors...", sectors_erased));
        }
    }

    fn writing(&mut self, bytes_to_write: usize) {
        self.create_bar(bytes_to_write as u64, "Writing");
    }

    fn write_progress(&mut self, bytes_written: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(bytes_written as u64);
        }
    }

    fn complete(&mut self, stats: &WriteStats) {
        self.finish("Write complete");

        if stats.used_fallback {
            println!(
                "Sector write: {} sectors erased, {} bytes written",
                stats.sectors_erased, stats.bytes_written
            );
        } else {
            println!("Wrote {} bytes into erased flash", stats.bytes_written);
        }
    }
}

impl Drop for IndicatifProgress {
    fn drop(&mut self) {
        self.finish_current();
    }
}

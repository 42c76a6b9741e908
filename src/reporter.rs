use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use toba_core::events::{EventSink, ExecutionEvent, LogLevel, StepStatus};

struct PartitionStat {
    total: u64,
    start: Instant,
    elapsed: Option<Duration>,
}

/// Renders engine events as status lines and one progress bar per transfer.
pub struct ConsoleReporter {
    pb: Mutex<Option<ProgressBar>>,
    stats: Mutex<HashMap<String, PartitionStat>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            pb: Mutex::new(None),
            stats: Mutex::new(HashMap::new()),
        }
    }

    fn println(&self, msg: String) {
        match lock(&self.pb).as_ref() {
            Some(pb) => pb.println(msg),
            None => println!("{}", msg),
        }
    }

    fn start_bar(&self, partition: &str, total: u64) {
        let pb = if total > 0 {
            ProgressBar::new(total)
        } else {
            ProgressBar::new_spinner()
        };
        let style = ProgressStyle::with_template(
            "{spinner} {msg} [{elapsed_precise}<{eta_precise}] {wide_bar} {bytes}/{total_bytes} {bytes_per_sec}",
        )
        .map(|s| s.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.set_message(format!("flash {}", partition));
        if let Some(old) = lock(&self.pb).replace(pb) {
            old.finish_and_clear();
        }
        lock(&self.stats).insert(
            partition.to_string(),
            PartitionStat {
                total,
                start: Instant::now(),
                elapsed: None,
            },
        );
    }

    fn finish_bar(&self, partition: &str) {
        if let Some(pb) = lock(&self.pb).take() {
            pb.finish_with_message(format!("{} done", partition));
        }
        if let Some(s) = lock(&self.stats).get_mut(partition) {
            s.elapsed = Some(s.start.elapsed());
        }
    }

    fn clear_bar(&self) {
        if let Some(pb) = lock(&self.pb).take() {
            pb.finish_and_clear();
        }
    }

    pub fn print_summary(&self) {
        let stats = lock(&self.stats);
        if stats.is_empty() {
            return;
        }
        let mut total_bytes: u128 = 0;
        let mut total_secs: f64 = 0.0;
        let mut fastest = (0.0_f64, String::new());
        let mut slowest = (f64::MAX, String::new());
        for (name, s) in stats.iter() {
            if let Some(el) = s.elapsed {
                let secs = el.as_secs_f64().max(1e-6);
                let speed = (s.total as f64) / secs / (1024.0 * 1024.0);
                total_bytes += s.total as u128;
                total_secs += secs;
                if speed > fastest.0 {
                    fastest = (speed, name.clone());
                }
                if speed < slowest.0 {
                    slowest = (speed, name.clone());
                }
            }
        }
        if total_secs > 0.0 {
            let avg = (total_bytes as f64) / total_secs / (1024.0 * 1024.0);
            println!(
                "\npartitions: {}  average {:.2} MiB/s  fastest {:.2} MiB/s [{}]  slowest {:.2} MiB/s [{}]",
                stats.len(),
                avg,
                fastest.0,
                fastest.1,
                slowest.0,
                slowest.1
            );
        } else {
            println!("\npartitions: {}", stats.len());
        }
    }
}

impl EventSink for ConsoleReporter {
    fn publish(&self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::PlanStarted { serial, steps, mode } => {
                println!(
                    "{} {} step(s) on {} (starting in {})",
                    ">>".cyan().bold(),
                    steps,
                    serial.yellow(),
                    mode
                );
            }
            ExecutionEvent::StepStarted {
                index,
                line,
                description,
            } => self.println(format!(
                "{} {}",
                format!("[{:>2}] line {:<3}", index, line).bright_cyan(),
                description.bright_white()
            )),
            ExecutionEvent::Progress {
                partition,
                done,
                total,
                ..
            } => {
                if done == 0 {
                    self.start_bar(&partition, total);
                } else if let Some(pb) = lock(&self.pb).as_ref() {
                    pb.set_position(done);
                }
                if total > 0 && done >= total {
                    self.finish_bar(&partition);
                }
            }
            ExecutionEvent::StepFinished { status, detail, .. } => {
                self.clear_bar();
                let detail = detail.unwrap_or_default();
                match status {
                    StepStatus::Success => println!("     {} {}", "✔".green().bold(), detail.green()),
                    StepStatus::Skipped => println!("     {} skipped {}", "-".yellow(), detail.yellow()),
                    StepStatus::Failed => println!("     {} {}", "✗".red().bold(), detail.red()),
                }
            }
            ExecutionEvent::Log { level, message } => match level {
                LogLevel::Info => self.println(format!("     {}", message.bright_black())),
                LogLevel::Warn => self.println(format!("     {} {}", "⚠".yellow(), message.yellow())),
            },
            ExecutionEvent::PlanFinished { succeeded, summary } => {
                self.clear_bar();
                if succeeded {
                    println!("{} {}", "✔".green().bold(), summary.green());
                } else {
                    println!("{} {}", "[!]".red().bold(), summary.red());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_records_partition_stats() {
        let reporter = ConsoleReporter::new();
        for done in [0, 512, 1024] {
            reporter.publish(ExecutionEvent::Progress {
                index: 0,
                partition: "boot_a".into(),
                done,
                total: 1024,
            });
        }
        let stats = lock(&reporter.stats);
        let stat = &stats["boot_a"];
        assert_eq!(stat.total, 1024);
        assert!(stat.elapsed.is_some());
        assert!(lock(&reporter.pb).is_none());
    }
}

//! Progress indicator shown until the first output of a call arrives.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossterm::style::{Color, ResetColor, SetForegroundColor};
use crossterm::QueueableCommand;

const FRAMES: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];
const TICK: Duration = Duration::from_millis(100);

/// A ticking thread that shares only its "running" flag with the caller.
pub struct Spinner {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Spinner {
    pub fn start(message: &str) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let message = message.to_string();

        let handle = std::thread::spawn(move || {
            let mut frame = 0;
            let mut stdout = std::io::stdout();
            while flag.load(Ordering::Acquire) {
                let _ = stdout.queue(SetForegroundColor(Color::Cyan));
                let _ = write!(stdout, "\r{} {}...", FRAMES[frame % FRAMES.len()], message);
                let _ = stdout.queue(ResetColor);
                let _ = stdout.flush();
                frame += 1;
                std::thread::park_timeout(TICK);
            }
            let width = message.chars().count() + 8;
            let _ = write!(stdout, "\r{}\r", " ".repeat(width));
            let _ = stdout.flush();
        });

        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Wake the ticking thread and wait until the line is cleared. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.stop();
    }
}

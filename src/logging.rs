//! `log` backend that queues formatted lines for a writer task.
//!
//! Logging must never block the radio tasks, so `log()` only formats into a
//! bounded line and pushes it into a small ring. When the ring is full the
//! oldest line goes. The writer task drains the ring to any
//! `embedded_io_async::Write` port (USB Serial JTAG on the device).

use core::cell::RefCell;
use core::fmt::Write as _;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use heapless::{Deque, String};
use log::{LevelFilter, Log, Metadata, Record};

/// Longest line kept; longer lines are truncated
pub const MAX_LINE_LEN: usize = 160;

/// Lines buffered between writer wake-ups
const LINE_QUEUE_DEPTH: usize = 16;

pub type Line = String<MAX_LINE_LEN>;

struct Queue {
    lines: Deque<Line, LINE_QUEUE_DEPTH>,
    dropped: u32,
}

static LOG_QUEUE: Mutex<CriticalSectionRawMutex, RefCell<Queue>> =
    Mutex::new(RefCell::new(Queue {
        lines: Deque::new(),
        dropped: 0,
    }));

/// Raised whenever a line is queued
pub static LOG_SIGNAL: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Logger installed by [`init`]
pub struct QueueLogger {
    level: LevelFilter,
}

static LOGGER: QueueLogger = QueueLogger {
    level: LevelFilter::Info,
};

/// Install the queue logger as the global `log` backend
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LOGGER.level);
    }
}

impl Log for QueueLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        push_line(format_line(uptime_ms(), record.level(), *record.args()));
    }

    fn flush(&self) {}
}

#[cfg(feature = "embedded")]
fn uptime_ms() -> u64 {
    embassy_time::Instant::now().as_millis()
}

#[cfg(not(feature = "embedded"))]
fn uptime_ms() -> u64 {
    0
}

/// `[   12.345 INFO ] message`, truncated to [`MAX_LINE_LEN`]
pub fn format_line(now_ms: u64, level: log::Level, args: core::fmt::Arguments) -> Line {
    let mut line = Line::new();
    let _ = write!(
        line,
        "[{:>6}.{:03} {:<5}] ",
        now_ms / 1000,
        now_ms % 1000,
        level
    );
    let _ = Truncating(&mut line).write_fmt(args);
    line
}

/// Writes as much as fits and silently drops the rest
struct Truncating<'a>(&'a mut Line);

impl core::fmt::Write for Truncating<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for c in s.chars() {
            if self.0.push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Queue a line, evicting the oldest one when full
pub fn push_line(line: Line) {
    LOG_QUEUE.lock(|cell| {
        let mut queue = cell.borrow_mut();
        if queue.lines.is_full() {
            queue.lines.pop_front();
            queue.dropped = queue.dropped.wrapping_add(1);
        }
        let _ = queue.lines.push_back(line);
    });
    LOG_SIGNAL.signal(());
}

pub fn take_line() -> Option<Line> {
    LOG_QUEUE.lock(|cell| cell.borrow_mut().lines.pop_front())
}

/// Lines lost to overflow since boot
pub fn dropped_lines() -> u32 {
    LOG_QUEUE.lock(|cell| cell.borrow().dropped)
}

/// Drain queued lines to a serial port, forever
#[cfg(feature = "embedded")]
pub async fn log_writer_task<W: embedded_io_async::Write>(mut port: W) {
    loop {
        LOG_SIGNAL.wait().await;
        while let Some(line) = take_line() {
            // Nobody may be listening on the port
            let _ = port.write_all(line.as_bytes()).await;
            let _ = port.write_all(b"\r\n").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line() {
        let line = format_line(12_345, log::Level::Warn, format_args!("cache: {} dropped", 3));
        assert_eq!(line.as_str(), "[    12.345 WARN ] cache: 3 dropped");
    }

    #[test]
    fn test_long_line_truncated() {
        let long = [b'x'; 300];
        let text = core::str::from_utf8(&long).unwrap();
        let line = format_line(0, log::Level::Info, format_args!("{}", text));
        assert!(line.len() <= MAX_LINE_LEN);
        assert!(line.starts_with("[     0.000 INFO ] xxx"));
    }

    // The queue is global, so all queue behaviour lives in one test
    #[test]
    fn test_queue_drops_oldest() {
        while take_line().is_some() {}
        let before = dropped_lines();
        for i in 0..LINE_QUEUE_DEPTH + 2 {
            push_line(format_line(0, log::Level::Info, format_args!("line {}", i)));
        }
        assert_eq!(dropped_lines() - before, 2);
        let first = take_line().unwrap();
        assert!(first.ends_with("line 2"));
        let mut rest = 0;
        while take_line().is_some() {
            rest += 1;
        }
        assert_eq!(rest, LINE_QUEUE_DEPTH - 1);
    }
}

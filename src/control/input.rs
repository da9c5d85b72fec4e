//! Input capability consumed by the control loop

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A key or button the operator can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Char(char),
    Up,
    Down,
    Space,
}

impl Key {
    /// Parse a key name as typed on the terminal (`w`, `up`, `space`, ...)
    pub fn parse(name: &str) -> Option<Key> {
        match name.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Key::Up),
            "down" => Some(Key::Down),
            "space" | "flip" => Some(Key::Space),
            other => {
                let mut chars = other.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if c.is_ascii_alphanumeric() => Some(Key::Char(c)),
                    _ => None,
                }
            }
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Char(c) => write!(f, "{}", c),
            Key::Up => write!(f, "up"),
            Key::Down => write!(f, "down"),
            Key::Space => write!(f, "space"),
        }
    }
}

/// "Is this key currently active?" queries
pub trait InputSource: Send + Sync {
    fn is_active(&self, key: Key) -> bool;

    /// Identity of the press that makes `key` active.
    ///
    /// Sources reporting discrete presses return a distinct id per press so a
    /// consumer acts on each press once. Held-state sources return `None` and
    /// fire on every sample.
    fn press_id(&self, _key: Key) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct Press {
    at: Instant,
    id: u64,
}

#[derive(Debug, Default)]
struct LatchState {
    pressed: HashMap<Key, Press>,
    last_id: u64,
}

/// Input source where a press stays active for a fixed hold window.
///
/// Every session samples the same latch, so one press reaches the whole
/// swarm as long as the hold covers at least one polling interval. Each
/// press carries its own id, so a session acts on it only once.
#[derive(Debug)]
pub struct KeyLatch {
    state: Mutex<LatchState>,
    hold: Duration,
}

impl KeyLatch {
    pub fn new(hold: Duration) -> Self {
        Self {
            state: Mutex::new(LatchState::default()),
            hold,
        }
    }

    pub fn press(&self, key: Key) {
        let mut state = self.state.lock();
        state.last_id += 1;
        let press = Press {
            at: Instant::now(),
            id: state.last_id,
        };
        state.pressed.insert(key, press);
    }

    fn active_press(&self, key: Key) -> Option<Press> {
        self.state
            .lock()
            .pressed
            .get(&key)
            .copied()
            .filter(|press| press.at.elapsed() < self.hold)
    }

    /// Feed the latch from stdin, one or more key names per line.
    ///
    /// Runs on a plain thread so a pending read never holds up runtime
    /// shutdown; the thread exits on EOF or at the first line after `cancel`.
    pub fn spawn_stdin_reader(self: Arc<Self>, cancel: CancellationToken) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            info!("Reading keys from stdin (w/s/a/d, up/down, q/e, space, p, b, l)");

            for line in io::stdin().lock().lines() {
                if cancel.is_cancelled() {
                    break;
                }
                match line {
                    Ok(line) => self.press_names(&line),
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
            debug!("stdin reader stopped");
        })
    }

    /// Press every key named in a whitespace separated line
    pub fn press_names(&self, line: &str) {
        for name in line.split_whitespace() {
            match Key::parse(name) {
                Some(key) => {
                    debug!("Key pressed: {}", key);
                    self.press(key);
                }
                None => warn!("Unknown key '{}'", name),
            }
        }
    }
}

impl InputSource for KeyLatch {
    fn is_active(&self, key: Key) -> bool {
        self.active_press(key).is_some()
    }

    fn press_id(&self, key: Key) -> Option<u64> {
        self.active_press(key).map(|press| press.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parse() {
        assert_eq!(Key::parse("w"), Some(Key::Char('w')));
        assert_eq!(Key::parse("W"), Some(Key::Char('w')));
        assert_eq!(Key::parse(" up "), Some(Key::Up));
        assert_eq!(Key::parse("space"), Some(Key::Space));
        assert_eq!(Key::parse("wasd"), None);
        assert_eq!(Key::parse(""), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latch_expires_after_hold() {
        let latch = KeyLatch::new(Duration::from_millis(200));
        assert!(!latch.is_active(Key::Char('w')));

        latch.press(Key::Char('w'));
        assert!(latch.is_active(Key::Char('w')));
        assert!(!latch.is_active(Key::Char('s')));

        tokio::time::advance(Duration::from_millis(199)).await;
        assert!(latch.is_active(Key::Char('w')));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!latch.is_active(Key::Char('w')));
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_names() {
        let latch = KeyLatch::new(Duration::from_millis(200));
        latch.press_names("w  up bogus");
        assert!(latch.is_active(Key::Char('w')));
        assert!(latch.is_active(Key::Up));
        assert!(!latch.is_active(Key::Down));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_press_has_its_own_id() {
        let latch = KeyLatch::new(Duration::from_millis(200));
        assert_eq!(latch.press_id(Key::Char('w')), None);

        latch.press(Key::Char('w'));
        let first = latch.press_id(Key::Char('w'));
        assert!(first.is_some());
        assert_eq!(latch.press_id(Key::Char('w')), first);

        latch.press(Key::Char('w'));
        assert_ne!(latch.press_id(Key::Char('w')), first);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(latch.press_id(Key::Char('w')), None);
    }
}

//! Key names accepted by `press_key` and the input bytes they produce.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A key a shell session understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Key {
    /// Regular character
    Char(char),
    /// Enter/Return key
    Enter,
    /// Tab key (shell completion)
    Tab,
    /// Escape key
    Escape,
    /// Backspace key
    Backspace,
    /// Up arrow (history previous)
    Up,
    /// Down arrow (history next)
    Down,
    /// Left arrow
    Left,
    /// Right arrow
    Right,
    /// Home key
    Home,
    /// End key
    End,
    /// Ctrl + letter
    Ctrl(char),
    /// Alt + character
    Alt(char),
}

impl Key {
    /// Interrupt the foreground job.
    pub const INTERRUPT: Key = Key::Ctrl('c');

    /// Form feed, clears the screen in most shells.
    pub const CLEAR: Key = Key::Ctrl('l');

    /// Parse a key name such as `"Enter"`, `"Ctrl+c"`, `"Alt+b"` or `"x"`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Some(rest) = s.strip_prefix("Ctrl+") {
            let mut chars = rest.chars();
            return match (chars.next(), chars.next()) {
                (Some(ch), None) if ch.is_ascii_alphabetic() => Ok(Key::Ctrl(ch.to_ascii_lowercase())),
                _ => Err(Error::InvalidInput(format!("Invalid Ctrl+ key: {s}"))),
            };
        }

        if let Some(rest) = s.strip_prefix("Alt+") {
            let mut chars = rest.chars();
            return match (chars.next(), chars.next()) {
                (Some(ch), None) => Ok(Key::Alt(ch)),
                _ => Err(Error::InvalidInput(format!("Invalid Alt+ key: {s}"))),
            };
        }

        match s {
            "Enter" | "Return" => Ok(Key::Enter),
            "Tab" => Ok(Key::Tab),
            "Escape" | "Esc" => Ok(Key::Escape),
            "Backspace" => Ok(Key::Backspace),
            "Up" => Ok(Key::Up),
            "Down" => Ok(Key::Down),
            "Left" => Ok(Key::Left),
            "Right" => Ok(Key::Right),
            "Home" => Ok(Key::Home),
            "End" => Ok(Key::End),
            _ => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(ch), None) => Ok(Key::Char(ch)),
                    _ => Err(Error::InvalidInput(format!("Unknown key: {s}"))),
                }
            }
        }
    }

    /// The text written to the session input for this key.
    pub fn to_input(&self) -> String {
        match self {
            Key::Char(c) => c.to_string(),
            Key::Enter => "\r".to_string(),
            Key::Tab => "\t".to_string(),
            Key::Escape => "\x1b".to_string(),
            Key::Backspace => "\x7f".to_string(),
            Key::Up => "\x1b[A".to_string(),
            Key::Down => "\x1b[B".to_string(),
            Key::Right => "\x1b[C".to_string(),
            Key::Left => "\x1b[D".to_string(),
            Key::Home => "\x1b[H".to_string(),
            Key::End => "\x1b[F".to_string(),
            Key::Ctrl(c) => {
                // Ctrl+A = 0x01, Ctrl+Z = 0x1A
                let code = (*c as u8).to_ascii_lowercase() & 0x1f;
                char::from(code).to_string()
            }
            Key::Alt(c) => format!("\x1b{c}"),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Char(c) => write!(f, "{c}"),
            Key::Enter => write!(f, "Enter"),
            Key::Tab => write!(f, "Tab"),
            Key::Escape => write!(f, "Escape"),
            Key::Backspace => write!(f, "Backspace"),
            Key::Up => write!(f, "Up"),
            Key::Down => write!(f, "Down"),
            Key::Left => write!(f, "Left"),
            Key::Right => write!(f, "Right"),
            Key::Home => write!(f, "Home"),
            Key::End => write!(f, "End"),
            Key::Ctrl(c) => write!(f, "Ctrl+{c}"),
            Key::Alt(c) => write!(f, "Alt+{c}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parse_char() {
        assert_eq!(Key::parse("a").unwrap(), Key::Char('a'));
        assert_eq!(Key::parse("5").unwrap(), Key::Char('5'));
        assert_eq!(Key::parse("é").unwrap(), Key::Char('é'));
    }

    #[test]
    fn test_key_parse_named() {
        assert_eq!(Key::parse("Enter").unwrap(), Key::Enter);
        assert_eq!(Key::parse("Return").unwrap(), Key::Enter);
        assert_eq!(Key::parse("Esc").unwrap(), Key::Escape);
        assert_eq!(Key::parse(" Up ").unwrap(), Key::Up);
    }

    #[test]
    fn test_key_parse_ctrl() {
        assert_eq!(Key::parse("Ctrl+c").unwrap(), Key::Ctrl('c'));
        assert_eq!(Key::parse("Ctrl+C").unwrap(), Key::Ctrl('c'));
    }

    #[test]
    fn test_key_parse_invalid() {
        assert!(Key::parse("InvalidKey").is_err());
        assert!(Key::parse("Ctrl+").is_err());
        assert!(Key::parse("Ctrl+1").is_err());
        assert!(Key::parse("Alt+xy").is_err());
    }

    #[test]
    fn test_key_to_input() {
        assert_eq!(Key::Enter.to_input(), "\r");
        assert_eq!(Key::INTERRUPT.to_input(), "\x03");
        assert_eq!(Key::CLEAR.to_input(), "\x0c");
        assert_eq!(Key::Ctrl('z').to_input(), "\x1a");
        assert_eq!(Key::Alt('b').to_input(), "\x1bb");
        assert_eq!(Key::Up.to_input(), "\x1b[A");
    }

    #[test]
    fn test_key_display_parses_back() {
        for name in ["Enter", "Tab", "Up", "Ctrl+c", "Alt+f", "x"] {
            let key = Key::parse(name).unwrap();
            assert_eq!(Key::parse(&key.to_string()).unwrap(), key);
        }
    }
}

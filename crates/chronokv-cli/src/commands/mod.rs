pub mod data;
pub mod nodes;

use anyhow::{Context, Result};
use colored::Colorize;
use comfy_table::{Table, presets::UTF8_FULL};
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct OutputContext {
    pub json: bool,
    pub hex: bool,
    pub verbose: bool,
}

impl OutputContext {
    /// Decode a key or value given on the command line
    pub fn input(&self, text: &str) -> Result<Vec<u8>> {
        if self.hex {
            hex::decode(text).with_context(|| format!("`{text}` is not valid hex"))
        } else {
            Ok(text.as_bytes().to_vec())
        }
    }

    /// Render stored bytes for display
    pub fn render(&self, bytes: &[u8]) -> String {
        if self.hex {
            hex::encode(bytes)
        } else {
            String::from_utf8_lossy(bytes).into_owned()
        }
    }

    pub fn print_json(&self, value: &Value) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    pub fn print_table(&self, columns: &[&str], rows: &[Vec<String>]) {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(columns.to_vec());
        for row in rows {
            table.add_row(row.clone());
        }
        println!("{table}");
        if self.verbose {
            println!("{} row(s)", rows.len());
        }
    }

    pub fn print_success(&self, message: &str) {
        println!("{} {}", "✓".green(), message);
    }

    pub fn print_info(&self, message: &str) {
        println!("{} {}", "ℹ".blue(), message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_and_render() {
        let text = OutputContext::default();
        assert_eq!(text.input("abc").unwrap(), b"abc");
        assert_eq!(text.render(b"abc"), "abc");

        let hex = OutputContext {
            hex: true,
            ..Default::default()
        };
        assert_eq!(hex.input("00ff").unwrap(), vec![0x00, 0xff]);
        assert_eq!(hex.render(&[0x00, 0xff]), "00ff");
        assert!(hex.input("zz").is_err());
    }
}

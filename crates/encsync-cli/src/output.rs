//! Output formatting for human and JSON modes

/// Output format selector
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Trait for formatting CLI output
pub trait OutputFormatter: Send + Sync {
    fn success(&self, message: &str);
    fn error(&self, message: &str);
    fn warn(&self, message: &str);
    fn info(&self, message: &str);
    fn print_json(&self, value: &serde_json::Value);
}

/// Human-readable output with status marks
pub struct HumanFormatter;

impl OutputFormatter for HumanFormatter {
    fn success(&self, message: &str) {
        println!("\u{2713} {message}");
    }
    fn error(&self, message: &str) {
        eprintln!("\u{2717} {message}");
    }
    fn warn(&self, message: &str) {
        eprintln!("\u{26a0} {message}");
    }
    fn info(&self, message: &str) {
        println!("  {message}");
    }
    fn print_json(&self, _value: &serde_json::Value) {}
}

/// One JSON document per result; informational lines are suppressed
pub struct JsonFormatter;

impl JsonFormatter {
    fn line(level: &str, message: &str) -> String {
        serde_json::json!({ "level": level, "message": message }).to_string()
    }
}

impl OutputFormatter for JsonFormatter {
    fn success(&self, message: &str) {
        println!("{}", Self::line("success", message));
    }
    fn error(&self, message: &str) {
        eprintln!("{}", Self::line("error", message));
    }
    fn warn(&self, message: &str) {
        eprintln!("{}", Self::line("warning", message));
    }
    fn info(&self, _message: &str) {}
    fn print_json(&self, value: &serde_json::Value) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("{}", Self::line("error", &e.to_string())),
        }
    }
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }

    pub fn formatter(self) -> Box<dyn OutputFormatter> {
        match self {
            OutputFormat::Human => Box::new(HumanFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines_carry_level() {
        let line: serde_json::Value =
            serde_json::from_str(&JsonFormatter::line("warning", "slow")).unwrap();
        assert_eq!(line["level"], "warning");
        assert_eq!(line["message"], "slow");
    }

    #[test]
    fn test_format_from_flag() {
        assert_eq!(OutputFormat::from_json_flag(true), OutputFormat::Json);
        assert_eq!(OutputFormat::from_json_flag(false), OutputFormat::Human);
    }
}

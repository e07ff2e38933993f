// ============================================================================
// src/ui.rs – Operator-facing output (stdout for progress, stderr for errors)
// ============================================================================

use console::{style, Term};

/// Error marker every failure line starts with.
pub const ERROR_MARKER: &str = "znx: error:";

#[derive(Debug, Clone, Default)]
pub struct UX {
    pub quiet: bool,
}

impl UX {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{} {}", style("::").cyan().bold(), msg);
        }
    }

    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{} {}", style("✓").green().bold(), msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        println!("{} {}", style("!").yellow().bold(), msg);
    }

    pub fn error(&self, msg: &str) {
        eprintln!("{} {}", style(ERROR_MARKER).red().bold(), msg);
    }

    /// Plain line for machine-friendly output such as `list`.
    pub fn line(&self, msg: &str) {
        println!("{msg}");
    }

    /// Aligned key/value block, used by `stats`.
    pub fn data_panel(&self, title: &str, rows: &[(&str, String)]) {
        let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        println!("{}", style(title).bold());
        for (key, value) in rows {
            println!("  {:<width$}  {}", key, value, width = width);
        }
    }

    pub fn interactive(&self) -> bool {
        Term::stdout().is_term() && Term::stderr().is_term()
    }
}

/// Human readable byte count, e.g. `1.5 GiB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;

const CONFIG_TEMPLATE: &str = r#"# orin configuration
#
# Every value can also be set with an environment variable: ORIN_ plus the
# section and key joined by a double underscore, e.g.
#   ORIN_BACKEND__MODEL=~/models/qwen3-4b.gguf
#   ORIN_SESSION__VERIFY=true

# ── Backend ──────────────────────────────────────────────────────
# llama.cpp's llama-cli, either a path or a name on $PATH.

[backend]
binary = "llama-cli"
model = "~/models/model.gguf"
# Placed before the generated arguments.
# extra_args = ["--no-display-prompt", "-no-cnv", "-ngl", "0"]

# ── Generation ───────────────────────────────────────────────────

[generation]
temperature = 0.2
max_tokens = 1024
context_size = 4096
# threads = 8                      # defaults to the number of CPUs
# no_mmap = false

# ── Session ──────────────────────────────────────────────────────

[session]
# Question/answer pairs sent with each prompt.
window_size = 6
# Reasoning display: auto, always or never.
thinking = "auto"
# Critique and revise answers before accepting them (/verify toggles).
verify = false
# timeout_secs = 300
transcript = true
# transcript_dir = "~/.local/share/orin/sessions"
# system_prompt = "You are Orin, a helpful AI assistant."

# ── Reasoning markers ────────────────────────────────────────────

[markers]
open = "<think>"
close = "</think>"

# ── Verification ─────────────────────────────────────────────────

[verification]
# Maximum revisions per answer.
iteration_cap = 1
critique_temperature = 0.2
critique_max_tokens = 256
"#;

pub fn run() -> Result<()> {
    let config_dir = Config::config_dir()?;
    let config_path = config_dir.join("config.toml");

    // Create directory if needed
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;

    if config_path.exists() {
        println!("Existing config file found:");
        println!("  {}", config_path.display());
        print!("\nOverwrite? (The existing file will be backed up) [y/N] ");

        // Flush stdout so the prompt appears before reading
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Setup cancelled.");
            return Ok(());
        }

        backup_file(&config_path)?;
    }

    write_template(&config_path)?;
    println!("Created {}", config_path.display());

    println!("\nNext steps:");
    println!("  1. Point [backend] model at a GGUF file");
    println!("  2. Check the setup:   orin status");
    println!("  3. Start chatting:    orin");
    println!("  4. Or ask once:       orin -p \"hello world\"");

    Ok(())
}

fn write_template(path: &Path) -> Result<()> {
    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Back up a file to <name>.bak, appending a timestamp if .bak already exists.
fn backup_file(path: &Path) -> Result<()> {
    let mut backup = path.with_extension("toml.bak");

    if backup.exists() {
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let name = format!("toml.bak.{}", timestamp);
        backup = path.with_extension(name);
    }

    std::fs::rename(path, &backup)
        .with_context(|| format!("Failed to back up {} to {}", path.display(), backup.display()))?;
    println!("  Backed up to {}", backup.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_template(&path).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.session.window_size, 6);
        assert_eq!(config.markers.open, "<think>");
        assert!(config.backend.model.ends_with("models/model.gguf"));
    }

    #[test]
    fn test_backup_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "old").unwrap();

        backup_file(&path).unwrap();
        assert!(!path.exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("config.toml.bak")).unwrap(),
            "old"
        );
    }
}

use std::path::PathBuf;
use std::process::Command;

use log::info;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("nothing to render")]
    EmptyInput,
    #[error("audio rendering failed: {0}")]
    RenderError(String),
}

/// Renders a summary to speech through an external gtts-cli style command:
/// `<command> <text> --lang fr --output <file>`
pub struct TtsRenderer {
    command: String,
}

impl TtsRenderer {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }

    pub fn render(&self, text: &str) -> Result<PathBuf, AudioError> {
        if text.trim().is_empty() {
            return Err(AudioError::EmptyInput);
        }

        let output_path = std::env::temp_dir().join(format!("resume-{}.mp3", Uuid::new_v4()));

        let output = Command::new(&self.command)
            .arg(text)
            .arg("--lang")
            .arg("fr")
            .arg("--output")
            .arg(&output_path)
            .output()
            .map_err(|e| {
                AudioError::RenderError(format!("failed to launch '{}': {}", self.command, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AudioError::RenderError(format!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        if !output_path.exists() {
            return Err(AudioError::RenderError(
                "renderer reported success but produced no file".to_string(),
            ));
        }

        info!("🔊 Rendered audio to {}", output_path.display());
        Ok(output_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_text_is_rejected_before_spawning() {
        let renderer = TtsRenderer::new("this-binary-does-not-exist");
        assert!(matches!(renderer.render("   \n  "), Err(AudioError::EmptyInput)));
    }

    #[test]
    fn test_missing_command_is_a_render_error() {
        let renderer = TtsRenderer::new("this-binary-does-not-exist");
        match renderer.render("Bonjour") {
            Err(AudioError::RenderError(msg)) => assert!(msg.contains("launch")),
            other => panic!("expected RenderError, got {:?}", other),
        }
    }
}

use crate::debouncer::AlertKind;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::{Child, Command};

/// Plays alert sounds through an external player, one at a time.
#[derive(Debug)]
pub struct AudioPlayer {
    program: String,
    args: Vec<String>,
    guide: Option<PathBuf>,
    warning: Option<PathBuf>,
    current: Option<Child>,
}

impl AudioPlayer {
    /// `command` is the player program followed by its leading arguments.
    /// Sound files that don't exist are disabled with a warning.
    pub fn new(command: &[String], guide: &Path, warning: &Path) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("audio player command is empty"))?;

        Ok(AudioPlayer {
            program: program.clone(),
            args: args.to_vec(),
            guide: existing_sound("guide", guide),
            warning: existing_sound("warning", warning),
            current: None,
        })
    }

    /// True when no previously started sound is still playing.
    pub fn is_idle(&mut self) -> bool {
        let child = match self.current.as_mut() {
            Some(child) => child,
            None => return true,
        };

        match child.try_wait() {
            Ok(None) => false,
            Ok(Some(status)) => {
                if !status.success() {
                    log::warn!("audio player exited with {}", status);
                }
                self.current = None;
                true
            }
            Err(err) => {
                log::warn!("could not poll audio player: {}", err);
                self.current = None;
                true
            }
        }
    }

    pub fn play(&mut self, kind: AlertKind) -> Result<()> {
        let sound = match kind {
            AlertKind::Guide => self.guide.as_ref(),
            AlertKind::Warning => self.warning.as_ref(),
        };
        let sound = match sound {
            Some(sound) => sound,
            None => {
                log::debug!("no sound configured for {:?}", kind);
                return Ok(());
            }
        };

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(sound)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.program))?;
        log::debug!("playing {}", sound.display());
        self.current = Some(child);
        Ok(())
    }

    /// Cuts the current sound short.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.current.take() {
            if let Err(err) = child.kill().await {
                log::warn!("could not stop audio player: {}", err);
            }
        }
    }
}

fn existing_sound(name: &str, path: &Path) -> Option<PathBuf> {
    if path.exists() {
        log::info!("{} sound loaded: {}", name, path.display());
        Some(path.to_path_buf())
    } else {
        log::warn!("{} sound not found at {}", name, path.display());
        None
    }
}

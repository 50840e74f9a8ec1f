//! Systemd user unit install/uninstall for running the daemon at login.

use std::path::PathBuf;

use anyhow::{Context, Result};

const UNIT_NAME: &str = "agent-hub-daemon.service";

fn unit_path() -> Result<PathBuf> {
    let config = dirs::config_dir().context("no user config directory")?;
    Ok(config.join("systemd").join("user").join(UNIT_NAME))
}

fn render_unit(exe: &std::path::Path) -> String {
    format!(
        "[Unit]\n\
         Description=Agent Hub coordination daemon\n\
         After=network.target\n\
         \n\
         [Service]\n\
         ExecStart={}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n",
        exe.display()
    )
}

pub fn install() -> Result<PathBuf> {
    let path = unit_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let exe = std::env::current_exe().context("cannot resolve daemon binary path")?;
    std::fs::write(&path, render_unit(&exe))
        .with_context(|| format!("failed writing {}", path.display()))?;
    Ok(path)
}

/// Remove the unit file. Returns whether it existed.
pub fn uninstall() -> Result<bool> {
    let path = unit_path()?;
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed removing {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_references_binary_and_install_target() {
        let unit = render_unit(std::path::Path::new("/usr/local/bin/agent-hub-daemon"));
        assert!(unit.contains("ExecStart=/usr/local/bin/agent-hub-daemon"));
        assert!(unit.contains("WantedBy=default.target"));
        assert!(unit.contains("Restart=on-failure"));
    }
}

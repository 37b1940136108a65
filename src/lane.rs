//! Lane Notifier: announces a work package's lane transition to the
//! external task-file mutator. State is the source of truth; the lane file
//! is a human-visible projection of it, updated only after persistence.

use std::path::Path;
use std::process::Stdio;
use tracing::warn;

pub struct LaneNotifier {
    command: &'static str,
}

impl Default for LaneNotifier {
    fn default() -> Self {
        LaneNotifier { command: "move-task" }
    }
}

impl LaneNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire-and-log-on-failure: a failure to update the lane file never fails
    /// the run, but the exact command is logged so it can be replayed by hand.
    pub async fn notify(&self, repo_root: &Path, wp_id: &str, target_lane: &str, note: &str) {
        let mut command = tokio::process::Command::new(self.command);
        command
            .arg(wp_id)
            .arg("--to")
            .arg(target_lane)
            .arg("--note")
            .arg(note)
            .current_dir(repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        match command.output().await {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                warn!(
                    wp_id,
                    target_lane,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "lane notifier exited non-zero; replay manually with: {} {} --to {} --note \"{}\"",
                    self.command, wp_id, target_lane, note
                );
            }
            Err(source) => {
                warn!(
                    wp_id,
                    target_lane,
                    %source,
                    "failed to spawn lane notifier; replay manually with: {} {} --to {} --note \"{}\"",
                    self.command, wp_id, target_lane, note
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_against_missing_binary_does_not_panic() {
        let notifier = LaneNotifier { command: "definitely-not-a-real-binary-xyz" };
        let dir = tempfile::tempdir().unwrap();
        notifier.notify(dir.path(), "WP01", "doing", "started").await;
    }
}

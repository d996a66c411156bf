//! Interactive terminal detection

use std::io::IsTerminal;

/// Decides how status lines are rendered
#[derive(Debug, Clone)]
pub struct UiContext {
    interactive: bool,
}

impl UiContext {
    /// Detect the current environment
    pub fn detect() -> Self {
        Self {
            interactive: Self::detect_interactive(),
        }
    }

    /// Plain output regardless of the terminal
    pub fn non_interactive() -> Self {
        Self { interactive: false }
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn detect_interactive() -> bool {
        if !std::io::stdout().is_terminal() {
            return false;
        }

        // Batch jobs and CI runners set these
        let batch_vars = ["CI", "SLURM_JOB_ID", "PBS_JOBID", "GITHUB_ACTIONS", "JENKINS_URL"];
        !batch_vars.iter().any(|var| std::env::var_os(var).is_some())
    }
}

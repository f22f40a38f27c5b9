use anyhow::Result;
use crossterm::{
    style::{self, Colorize, Styler},
    QueueableCommand,
};
use std::io::Write;

use crate::models::{BuildResult, CheckKind, CheckOutcome, VerificationReport};

/// Lines of stderr shown under a failed check.
const STDERR_EXCERPT_LINES: usize = 5;

/// Operator facing output. Diagnostics go through `log` instead.
pub struct Console<W: Write> {
    out: W,
}

impl<W: Write> Console<W> {
    pub fn new(out: W) -> Console<W> {
        Console { out }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }

    pub fn info(&mut self, message: &str) -> Result<()> {
        self.out
            .queue(style::PrintStyledContent("INFO: ".cyan().bold()))?
            .queue(style::Print(format!("{}\n", message)))?
            .flush()?;

        Ok(())
    }

    /// Echoes one line of build output.
    pub fn progress(&mut self, line: &str) -> Result<()> {
        self.out.queue(style::Print(format!("{}\n", line)))?.flush()?;

        Ok(())
    }

    pub fn built(&mut self, result: &BuildResult) -> Result<()> {
        self.out
            .queue(style::PrintStyledContent("BUILT ".green().bold()))?
            .queue(style::Print(format!("{}\n", result.alias)))?
            .queue(style::Print(format!("  image id: {}\n", result.image_id.0)))?
            .queue(style::Print(format!("  build id: {}\n", result.build_id.0)))?
            .queue(style::Print(format!("  alias:    {}\n", result.alias.0)))?
            .flush()?;

        Ok(())
    }

    pub fn outcome(&mut self, outcome: &CheckOutcome) -> Result<()> {
        let label = match outcome.kind {
            CheckKind::Command => outcome.label.clone(),
            CheckKind::Smoke => format!("{} (smoke)", outcome.label),
        };

        if outcome.passed {
            let first_line = outcome.stdout.lines().next().unwrap_or("").trim();
            self.out
                .queue(style::PrintStyledContent("PASS ".green().bold()))?
                .queue(style::Print(format!("{}  {}\n", label, first_line)))?;
        } else {
            self.out
                .queue(style::PrintStyledContent("FAIL ".red().bold()))?
                .queue(style::Print(format!(
                    "{} (exit {}): {}\n",
                    label, outcome.exit_code, outcome.command
                )))?;

            for line in outcome.stderr.lines().take(STDERR_EXCERPT_LINES) {
                self.out.queue(style::Print(format!("     {}\n", line)))?;
            }
        }

        self.out.flush()?;

        Ok(())
    }

    pub fn summary(&mut self, report: &VerificationReport) -> Result<()> {
        let failed = report.failures().count();
        let total = report.entries.len();

        let verdict = if failed == 0 {
            "OK ".green().bold()
        } else {
            "FAILED ".red().bold()
        };

        self.out
            .queue(style::PrintStyledContent(verdict))?
            .queue(style::Print(format!(
                "{}/{} checks passed on {} ({})\n",
                total - failed,
                total,
                report.alias,
                report.instance
            )))?;

        if let Some(teardown_error) = &report.teardown_error {
            self.out
                .queue(style::PrintStyledContent("WARN: ".yellow().bold()))?
                .queue(style::Print(format!("{}\n", teardown_error)))?;
        }

        self.out.flush()?;

        Ok(())
    }
}

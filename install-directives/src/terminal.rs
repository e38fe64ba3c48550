use anyhow::{bail, Result};
use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEvent, KeyModifiers},
    style::{self, Colorize, Styler},
    terminal, QueueableCommand,
};
use std::io::Write;

use crate::services::{Outcome, SecretPrompt, SweepProgress};

/// Prints one line per planned step and marks each as it finishes.
pub struct TerminalProgress<W: Write> {
    out: W,
    lines: usize,
    longest_line: usize,
}

impl<W: Write> TerminalProgress<W> {
    pub fn new(out: W) -> TerminalProgress<W> {
        TerminalProgress {
            out,
            lines: 0,
            longest_line: 0,
        }
    }
}

impl<W: Write> SweepProgress for TerminalProgress<W> {
    fn planned(&mut self, verb: &str, items: &[String]) -> Result<()> {
        let lines = items
            .iter()
            .map(|item| format!("{} {}", verb, item))
            .collect::<Vec<_>>();

        self.longest_line = lines.iter().map(|line| line.len()).max().unwrap_or(0);
        self.lines = lines.len();

        for line in lines.iter() {
            self.out.queue(style::Print(line))?;

            let padding = self.longest_line - line.len() + 1;
            self.out
                .queue(cursor::MoveRight(padding as u16))?
                .queue(style::Print("...\n"))?;
        }

        self.out.flush()?;
        Ok(())
    }

    fn finished(&mut self, index: usize, outcome: Outcome) -> Result<()> {
        let marker = match outcome {
            Outcome::Done => "done".green().bold(),
            Outcome::UpToDate => "up to date".green(),
            Outcome::Missing => "missing".yellow(),
            Outcome::Failed => "failed".red().bold(),
        };

        self.out
            .queue(cursor::SavePosition)?
            .queue(cursor::MoveToPreviousLine((self.lines - index) as u16))?
            .queue(cursor::MoveRight(self.longest_line as u16 + 5))?
            .queue(style::PrintStyledContent(marker))?
            .queue(cursor::RestorePosition)?
            .flush()?;

        Ok(())
    }
}

/// Leaves raw mode however the prompt ends.
struct RawMode;

impl RawMode {
    fn enable() -> Result<RawMode> {
        terminal::enable_raw_mode()?;
        Ok(RawMode)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Reads secret values from the terminal without echoing them.
pub struct HiddenPrompt;

impl SecretPrompt for HiddenPrompt {
    fn prompt(&mut self, name: &str) -> Result<String> {
        let mut out = std::io::stdout();
        out.queue(style::Print(format!("Enter value for secret {}: ", name)))?
            .flush()?;

        let mut value = String::new();
        {
            let _raw = RawMode::enable()?;
            loop {
                match event::read()? {
                    Event::Key(KeyEvent {
                        code: KeyCode::Char('c'),
                        modifiers,
                    }) if modifiers.contains(KeyModifiers::CONTROL) => {
                        bail!("interrupted while reading secret {}", name)
                    }
                    Event::Key(KeyEvent {
                        code: KeyCode::Enter,
                        ..
                    }) => break,
                    Event::Key(KeyEvent {
                        code: KeyCode::Backspace,
                        ..
                    }) => {
                        value.pop();
                    }
                    Event::Key(KeyEvent {
                        code: KeyCode::Char(c),
                        ..
                    }) => value.push(c),
                    _ => (),
                }
            }
        }

        out.queue(style::Print("\n"))?.flush()?;
        Ok(value)
    }
}

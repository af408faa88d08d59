//! Raw-mode control over the process's terminal.
//!
//! Raw mode disables echo, canonical buffering, signal generation,
//! software flow control, CR/NL translation and output post-processing,
//! forces 8-bit characters, and sets `MIN=1, TIME=0`. Restoration is
//! guaranteed on every exit path, including panics, via a drop guard.

use std::io::{IsTerminal, stdin};

use nix::sys::termios::{
    ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios,
    tcgetattr, tcsetattr,
};

/// Errors raised by the terminal controller.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TerminalError {
    /// Reading the current terminal attributes failed.
    #[error("failed to get terminal attributes: {0}")]
    FailedToGetAttributes(nix::errno::Errno),

    /// Applying terminal attributes failed.
    #[error("failed to set terminal attributes: {0}")]
    FailedToSetAttributes(nix::errno::Errno),
}

/// Returns `true` if stdin is attached to a terminal.
pub fn is_terminal() -> bool {
    stdin().is_terminal()
}

/// Guard holding the attributes saved before raw mode was enabled.
///
/// Dropping the guard restores them.
#[derive(Debug)]
pub struct RawMode {
    /// Attributes to restore.
    saved: Termios,
}

/// Switches stdin into raw mode, returning a guard that restores the
/// previous attributes when dropped.
pub fn enable_raw_mode() -> Result<RawMode, TerminalError> {
    let saved = tcgetattr(stdin()).map_err(TerminalError::FailedToGetAttributes)?;

    let mut raw = saved.clone();
    raw.local_flags
        .remove(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::IEXTEN);
    raw.input_flags.remove(
        InputFlags::IXON
            | InputFlags::IXOFF
            | InputFlags::ICRNL
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::BRKINT
            | InputFlags::ISTRIP,
    );
    raw.output_flags.remove(OutputFlags::OPOST);
    raw.control_flags
        .remove(ControlFlags::CSIZE | ControlFlags::PARENB);
    raw.control_flags.insert(ControlFlags::CS8);
    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    tcsetattr(stdin(), SetArg::TCSAFLUSH, &raw).map_err(TerminalError::FailedToSetAttributes)?;
    Ok(RawMode { saved })
}

impl RawMode {
    /// Restores the saved attributes now, consuming the guard.
    pub fn restore(self) -> Result<(), TerminalError> {
        let result = tcsetattr(stdin(), SetArg::TCSAFLUSH, &self.saved)
            .map_err(TerminalError::FailedToSetAttributes);
        std::mem::forget(self);
        result
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = tcsetattr(stdin(), SetArg::TCSAFLUSH, &self.saved);
    }
}

/// Runs `f` in raw mode, restoring the terminal on all exit paths.
pub fn with_raw_mode<T>(f: impl FnOnce() -> T) -> Result<T, TerminalError> {
    let guard = enable_raw_mode()?;
    let out = f();
    guard.restore()?;
    Ok(out)
}

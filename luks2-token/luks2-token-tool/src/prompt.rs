use std::io::{self, BufRead, Write};
use std::sync::mpsc;
use std::time::Duration;

use luks2_token::{Result, TokenError};
use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use tpm2_token::Prompt;
use zeroize::Zeroizing;

/// Restores terminal echo when dropped.
struct EchoOff(Option<Termios>);

impl EchoOff {
    fn new() -> Self {
        let stdin = io::stdin();
        let Ok(saved) = termios::tcgetattr(&stdin) else {
            return Self(None);
        };

        let mut quiet = saved.clone();
        quiet.local_flags.remove(LocalFlags::ECHO);
        match termios::tcsetattr(&stdin, SetArg::TCSANOW, &quiet) {
            Ok(()) => Self(Some(saved)),
            Err(e) => {
                log::debug!("cannot disable terminal echo: {e}");
                Self(None)
            }
        }
    }
}

impl Drop for EchoOff {
    fn drop(&mut self) {
        if let Some(saved) = &self.0 {
            let _ = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, saved);
        }
    }
}

fn read_line(timeout: Option<Duration>) -> Result<Zeroizing<Vec<u8>>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut line = Zeroizing::new(String::new());
        let read = io::stdin().lock().read_line(&mut line).map(|_| line);
        let _ = tx.send(read);
    });

    let read = match timeout {
        Some(timeout) => rx.recv_timeout(timeout).map_err(|_| {
            log::error!("Timeout reached while waiting for passphrase.");
            TokenError::InvalidArgument
        })?,
        None => rx.recv().map_err(|_| TokenError::InvalidArgument)?,
    };

    let line = read.map_err(|e| {
        log::error!("Failed to read passphrase: {e}.");
        TokenError::InvalidArgument
    })?;

    Ok(Zeroizing::new(
        line.trim_end_matches(['\r', '\n']).as_bytes().to_vec(),
    ))
}

/// Reads passphrases from the controlling terminal.
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn passphrase(
        &mut self,
        message: &str,
        timeout: Option<Duration>,
        verify: bool,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let _echo = EchoOff::new();

        eprint!("{message} ");
        let _ = io::stderr().flush();
        let first = read_line(timeout)?;
        eprintln!();

        if verify {
            eprint!("Verify passphrase: ");
            let _ = io::stderr().flush();
            let second = read_line(timeout)?;
            eprintln!();

            if first != second {
                log::error!("Passphrases do not match.");
                return Err(TokenError::InvalidArgument);
            }
        }

        Ok(first)
    }
}

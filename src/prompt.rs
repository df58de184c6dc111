//! Interactive prompting, gated by the `abort_on_prompts` configuration key.

use std::io::{self, BufRead, Write};

use crate::config;
use crate::error::Error;

/// Prints `message` and reads a line from stdin, unless `abort_on_prompts` is set in the
/// active scope (the default for parallel workers — see [`crate::parallel`]), in which case
/// this fails with [`Error::Prompted`] instead of blocking on input that will never arrive.
pub fn prompt(message: &str) -> Result<String, Error> {
    let abort_on_prompts = config::get("abort_on_prompts")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if abort_on_prompts {
        return Err(Error::Prompted);
    }

    print!("{message}");
    io::stdout().flush().map_err(Error::IOError)?;

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(Error::IOError)?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

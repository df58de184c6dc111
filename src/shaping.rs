//! Pure, side-effect-free transforms that turn a raw command into its wire form.
//!
//! The three wraps are always applied in the same fixed order: current-directory, then
//! shell, then sudo. Each is a no-op when its corresponding setting isn't present.

use std::borrow::Cow;

/// Escapes `"`, `$`, and `` ` `` with a leading backslash so the command can be embedded
/// inside a double-quoted `bash -c "..."` string.
///
/// This is deliberately *not* the whitelist/single-quote algorithm in [`crate::escape`] —
/// that one is for individual argv entries, this one is for an entire command string that
/// is about to be re-quoted as a single shell argument.
pub fn shell_escape(command: &str) -> Cow<'_, str> {
    if !command.contains(['"', '$', '`']) {
        return Cow::Borrowed(command);
    }

    let mut escaped = String::with_capacity(command.len() + 4);
    for c in command.chars() {
        if matches!(c, '"' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    Cow::Owned(escaped)
}

/// Wraps `command` in `cd "<dir>" && <command>` when `dir` is given.
pub fn cwd_wrap(command: &str, dir: Option<&str>) -> String {
    match dir {
        Some(dir) => format!("cd \"{dir}\" && {command}"),
        None => command.to_string(),
    }
}

/// Wraps `command` in `/bin/bash -l -c "<escaped command>"`.
pub fn shell_wrap(command: &str) -> String {
    format!("/bin/bash -l -c \"{}\"", shell_escape(command))
}

/// Prefixes `command` with `sudo --non-interactive `.
pub fn sudo_wrap(command: &str) -> String {
    format!("sudo --non-interactive {command}")
}

/// Applies cwd-wrap, then shell-wrap (if requested), then sudo-wrap (if requested), in that
/// fixed order.
pub fn shape(command: &str, remote_working_dir: Option<&str>, use_shell: bool, use_sudo: bool) -> String {
    let mut shaped = cwd_wrap(command, remote_working_dir);
    if use_shell {
        shaped = shell_wrap(&shaped);
    }
    if use_sudo {
        shaped = sudo_wrap(&shaped);
    }
    shaped
}

/// Joins a list of commands with ` && `. Returns `None` for an empty list so callers don't
/// confuse "no commands" with "an empty command".
pub fn join_commands<S: AsRef<str>>(commands: &[S]) -> Option<String> {
    if commands.is_empty() {
        return None;
    }
    Some(
        commands
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(" && "),
    )
}

/// Joins a list of commands into one `cmd1 && cmd2 && ...` string, or `None` when `commands`
/// is `None` or empty. Each item is rendered with its `Display` impl, so a list of `i32`s (as
/// well as strings) works the same way it does for callers passing stringly-typed argv
/// pieces.
pub fn single_command<T: std::fmt::Display>(commands: Option<&[T]>) -> Option<String> {
    let commands = commands?;
    if commands.is_empty() {
        return None;
    }
    Some(
        commands
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" && "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_escape_passes_through_plain_text() {
        assert_eq!(shell_escape("echo hello"), "echo hello");
    }

    #[test]
    fn shell_escape_escapes_quotes_dollar_and_backtick() {
        assert_eq!(
            shell_escape(r#"echo "hello world""#),
            r#"echo \"hello world\""#
        );
        assert_eq!(shell_escape("echo $HOME"), r"echo \$HOME");
        assert_eq!(shell_escape("echo `whoami`"), r"echo \`whoami\`");
    }

    #[test]
    fn shell_wrap_matches_contractual_format() {
        assert_eq!(
            shell_wrap(r#"echo "hello world""#),
            r#"/bin/bash -l -c "echo \"hello world\"""#
        );
    }

    #[test]
    fn sudo_wrap_prefixes_exactly() {
        assert_eq!(sudo_wrap("whoami"), "sudo --non-interactive whoami");
    }

    #[test]
    fn cwd_wrap_is_noop_without_dir() {
        assert_eq!(cwd_wrap("ls", None), "ls");
    }

    #[test]
    fn shape_applies_cwd_then_shell_then_sudo() {
        let shaped = shape("whoami", Some("/tmp"), true, true);
        assert!(shaped.starts_with("sudo --non-interactive /bin/bash -l -c \""));
        assert!(shaped.ends_with('"'));
        assert!(shaped.contains("cd \\\"/tmp\\\" && whoami"));
    }

    #[test]
    fn join_commands_empty_is_none() {
        assert_eq!(join_commands::<&str>(&[]), None);
    }

    #[test]
    fn join_commands_single_is_itself() {
        assert_eq!(join_commands(&["a"]), Some("a".to_string()));
    }

    #[test]
    fn join_commands_multiple() {
        assert_eq!(
            join_commands(&["a", "b", "c"]),
            Some("a && b && c".to_string())
        );
    }

    #[test]
    fn single_command_none_cases() {
        assert_eq!(single_command::<&str>(None), None);
        assert_eq!(single_command::<&str>(Some(&[])), None);
    }

    #[test]
    fn single_command_joins_and_stringifies() {
        assert_eq!(single_command(Some(&["foo"])), Some("foo".to_string()));
        assert_eq!(
            single_command(Some(&["foo", "bar", "baz"])),
            Some("foo && bar && baz".to_string())
        );
        assert_eq!(
            single_command(Some(&[1, 2, 3])),
            Some("1 && 2 && 3".to_string())
        );
    }
}

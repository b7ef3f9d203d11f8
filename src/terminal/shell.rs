use std::path::PathBuf;
#[cfg(target_os = "macos")]
use std::process::Command;

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub path: PathBuf,
    pub name: String,
    pub login_args: Vec<String>,
}

impl ShellConfig {
    pub fn detect(shell_override: Option<String>) -> Self {
        let shell_path = shell_override
            .filter(|shell| !shell.trim().is_empty())
            .map(PathBuf::from)
            .or_else(Self::get_user_shell)
            .unwrap_or_else(|| PathBuf::from("/bin/bash"));

        let name = shell_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("bash")
            .to_string();

        let login_args = match name.as_str() {
            "fish" => vec!["--login".to_string()],
            "sh" | "dash" => Vec::new(),
            _ => vec!["-l".to_string()],
        };

        Self {
            path: shell_path,
            name,
            login_args,
        }
    }

    #[cfg(target_os = "macos")]
    fn get_user_shell() -> Option<PathBuf> {
        let username = whoami::username();
        let output = Command::new("dscl")
            .args([".", "-read", &format!("/Users/{username}"), "UserShell"])
            .output()
            .ok()?;

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .find(|line| line.starts_with("UserShell:"))
            .map(|line| PathBuf::from(line.trim_start_matches("UserShell:").trim()))
    }

    #[cfg(target_os = "linux")]
    fn get_user_shell() -> Option<PathBuf> {
        let username = whoami::username();
        std::fs::read_to_string("/etc/passwd")
            .ok()?
            .lines()
            .find(|line| line.starts_with(&format!("{username}:")))
            .and_then(|line| line.split(':').last())
            .filter(|shell| !shell.is_empty())
            .map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    fn get_user_shell() -> Option<PathBuf> {
        std::env::var_os("SHELL").map(PathBuf::from)
    }
}

const PROMPT_MARKERS: &[&str] = &["\x1b]133;A", "\x1b]133;B", "\x1b]633;A", "\x1b]633;B"];
const PROMPT_GLYPHS: &[char] = &['$', '#', '%', '>', '❯'];
const MAX_PROMPT_LINE: usize = 200;

/// Bytes written into a fresh shell to install prompt markers.
///
/// Each line starts with a space so `HISTCONTROL=ignorespace` keeps it out of
/// history. Safe mode skips integration entirely and only nudges the shell
/// into printing a prompt.
pub fn integration_command(shell: Option<&str>, safe_mode: bool) -> &'static str {
    if safe_mode {
        return "\r";
    }
    match shell {
        Some("bash") => {
            " __termdeck_prompt() { printf '\\033]133;A\\007'; }; PROMPT_COMMAND=\"__termdeck_prompt${PROMPT_COMMAND:+;$PROMPT_COMMAND}\"\r"
        }
        Some("zsh") => {
            " __termdeck_prompt() { printf '\\033]133;A\\007' }; precmd_functions+=(__termdeck_prompt)\r"
        }
        Some("fish") => {
            " function __termdeck_prompt --on-event fish_prompt; printf '\\e]133;A\\a'; end\r"
        }
        _ => "\r",
    }
}

/// True when `output` shows the shell waiting at an interactive prompt.
pub fn contains_prompt(output: &str) -> bool {
    if contains_prompt_marker(output) {
        return true;
    }

    let plain = strip_ansi(output);
    plain
        .lines()
        .rev()
        .map(str::trim_end)
        .find(|line| !line.is_empty())
        .is_some_and(|line| {
            line.chars().count() <= MAX_PROMPT_LINE && line.ends_with(PROMPT_GLYPHS)
        })
}

/// OSC 133/633 prompt marks only, without the prompt-glyph heuristic.
pub fn contains_prompt_marker(output: &str) -> bool {
    PROMPT_MARKERS.iter().any(|marker| output.contains(marker))
}

/// Remove CSI and OSC escape sequences, keeping printable text.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                for next in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&next) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(next) = chars.next() {
                    if next == '\x07' {
                        break;
                    }
                    if next == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {
                chars.next();
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_osc_prompt_marker() {
        assert!(contains_prompt("\x1b]133;A\x07user@host ~ "));
    }

    #[test]
    fn detects_plain_prompt_glyph_through_colors() {
        assert!(contains_prompt("Last login: today\r\n\x1b[32muser@host\x1b[0m:~$ "));
        assert!(contains_prompt("~/src ❯ "));
    }

    #[test]
    fn ordinary_output_is_not_a_prompt() {
        assert!(!contains_prompt("compiling termdeck v0.1.0\r\n"));
        assert!(!contains_prompt(""));
    }

    #[test]
    fn safe_mode_skips_integration() {
        assert_eq!(integration_command(Some("bash"), true), "\r");
        assert!(integration_command(Some("bash"), false).contains("133;A"));
        assert_eq!(integration_command(Some("nu"), false), "\r");
    }

    #[test]
    fn detect_honours_override() {
        let shell = ShellConfig::detect(Some("/usr/bin/fish".into()));
        assert_eq!(shell.name, "fish");
        assert_eq!(shell.login_args, vec!["--login".to_string()]);
    }
}

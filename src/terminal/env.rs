use std::collections::{HashMap, HashSet};

use super::shell::ShellConfig;
use super::TerminalId;
use crate::constants::TERM_PROGRAM;

const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "SHELL", "TMPDIR", "LANG",
    "SSH_AUTH_SOCK", "SSH_AGENT_PID",
    "NVM_DIR", "NVM_BIN", "NVM_INC",
    "PYENV_ROOT", "PYENV_SHELL",
    "CARGO_HOME", "RUSTUP_HOME",
    "GOPATH", "GOROOT", "GOBIN",
    "BUN_INSTALL",
    "HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY",
    "http_proxy", "https_proxy", "no_proxy",
    "ANTHROPIC_API_KEY", "GEMINI_API_KEY", "OPENAI_API_KEY",
];

const ALLOWED_PREFIXES: &[&str] = &["TERMDECK_", "LC_", "XDG_"];

/// Environment for a terminal shell: the allow-listed part of our own
/// environment plus the variables agents and integration scripts rely on.
pub fn build_terminal_env(shell: &ShellConfig, terminal_id: &TerminalId) -> HashMap<String, String> {
    let allowed: HashSet<&str> = ALLOWED_ENV_VARS.iter().copied().collect();
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(key, _)| {
            allowed.contains(key.as_str())
                || ALLOWED_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
        })
        .collect();

    env.insert("TERMDECK_TERMINAL_ID".into(), terminal_id.to_string());
    env.insert("TERM".into(), "xterm-256color".into());
    env.insert("COLORTERM".into(), "truecolor".into());
    env.insert("TERM_PROGRAM".into(), TERM_PROGRAM.into());
    env.insert("SHELL".into(), shell.path.to_string_lossy().to_string());
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn terminal_env_carries_identity_and_term() {
        let shell = ShellConfig {
            path: PathBuf::from("/bin/zsh"),
            name: "zsh".into(),
            login_args: vec!["-l".into()],
        };
        let env = build_terminal_env(&shell, &TerminalId::new("t-9"));

        assert_eq!(env.get("TERMDECK_TERMINAL_ID").map(String::as_str), Some("t-9"));
        assert_eq!(env.get("TERM").map(String::as_str), Some("xterm-256color"));
        assert_eq!(env.get("SHELL").map(String::as_str), Some("/bin/zsh"));
        assert!(!env.contains_key("ZDOTDIR"));
    }
}

use crate::automation::plan::Prompt;
use crate::config::PromptConfig;
use crate::error::PilotResult;
use regex::{Regex, RegexBuilder};
use std::sync::OnceLock;

/// Compiled prompt vocabularies.
#[derive(Debug, Clone)]
pub struct PromptMatcher {
    passphrase: Vec<Regex>,
    shell: Vec<Regex>,
    sudo_password: Vec<Regex>,
}

impl PromptMatcher {
    pub fn new(config: &PromptConfig) -> PilotResult<Self> {
        Ok(Self {
            passphrase: compile(&config.passphrase)?,
            shell: compile(&config.shell)?,
            sudo_password: compile(&config.sudo_password)?,
        })
    }

    /// Whether `output` ends in (or contains) the given prompt.
    ///
    /// Shell prompts are only looked for on the last line, since a `$` or `>`
    /// earlier in the output is usually part of a command echo.
    pub fn matches(&self, prompt: Prompt, output: &str) -> bool {
        let clean = strip_ansi(output);
        match prompt {
            Prompt::Passphrase => any_match(&self.passphrase, &clean),
            Prompt::SudoPassword => any_match(&self.sudo_password, &clean),
            Prompt::Shell => {
                let last_line = clean.rsplit('\n').next().unwrap_or_default();
                let last_line = last_line.trim_end_matches('\r');
                !last_line.trim().is_empty() && any_match(&self.shell, last_line)
            }
        }
    }
}

impl Default for PromptMatcher {
    fn default() -> Self {
        Self::new(&PromptConfig::default()).expect("default prompt patterns compile")
    }
}

fn compile(patterns: &[String]) -> PilotResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(Into::into)
        })
        .collect()
}

fn any_match(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|regex| regex.is_match(text))
}

fn ansi_pattern() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\x1b[()][0-9A-Za-z]")
            .expect("ANSI pattern compiles")
    })
}

/// Drops terminal escape sequences so coloured prompts match plain patterns.
pub fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").into_owned()
}

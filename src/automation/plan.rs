use crate::config::{Strategy, Timings};
use crate::profile::{OsFamily, PlainProfile, SecretString, SudoPolicy};
use std::time::Duration;

pub const SUDO_SHELL_COMMAND: &str = "sudo -s";
pub const MISSING_SUDO_CREDENTIAL: &str =
    "No sudo password configured but a sudo command was requested; remaining commands cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    Passphrase,
    Shell,
    SudoPassword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepLabel {
    KeyPassphrase,
    SudoShell,
    SudoPassword,
    Command,
}

impl StepLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepLabel::KeyPassphrase => "key passphrase",
            StepLabel::SudoShell => "sudo shell",
            StepLabel::SudoPassword => "sudo password",
            StepLabel::Command => "command",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Line(String),
    Secret(SecretString),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Pause(Duration),
    WaitFor(Prompt),
    Send { label: StepLabel, input: Input },
    Abort(&'static str),
}

/// Ordered keystroke script for one login.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn build(profile: &PlainProfile, strategy: Strategy, timings: &Timings) -> Self {
        let mut plan = Plan::default();
        let sudo_aware = profile.os_family == OsFamily::Linux;
        let pace = match strategy {
            Strategy::FixedDelay => Pacing::Timed(*timings),
            Strategy::PromptDetection => Pacing::Detected,
        };

        if let Some(passphrase) = profile.passphrase() {
            pace.before_passphrase(&mut plan);
            plan.send(StepLabel::KeyPassphrase, Input::Secret(passphrase.clone()));
        }
        pace.after_login(&mut plan);

        if sudo_aware && profile.sudo_policy != SudoPolicy::Disabled {
            pace.before_command(&mut plan);
            plan.send(StepLabel::SudoShell, Input::Line(SUDO_SHELL_COMMAND.to_string()));
            if !plan.answer_sudo(profile.sudo_credential(), &pace) {
                return plan;
            }
        }

        for line in profile.startup_commands() {
            pace.before_command(&mut plan);
            plan.send(StepLabel::Command, Input::Line(line.to_string()));
            if sudo_aware && is_sudo_command(line) {
                if !plan.answer_sudo(profile.sudo_credential(), &pace) {
                    return plan;
                }
            } else {
                pace.after_command(&mut plan);
            }
        }
        plan
    }

    /// True when running the plan would type anything at all.
    pub fn sends_anything(&self) -> bool {
        self.steps
            .iter()
            .any(|step| matches!(step, Step::Send { .. }))
    }

    /// Non-secret lines in send order.
    pub fn lines(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                Step::Send {
                    input: Input::Line(line),
                    ..
                } => Some(line.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_command_steps(&self) -> bool {
        self.steps.iter().any(|step| {
            matches!(
                step,
                Step::Send {
                    label: StepLabel::Command,
                    ..
                }
            )
        })
    }

    fn send(&mut self, label: StepLabel, input: Input) {
        self.steps.push(Step::Send { label, input });
    }

    /// Appends the sudo password exchange, or an abort when there is nothing to type.
    fn answer_sudo(&mut self, credential: Option<&SecretString>, pace: &Pacing) -> bool {
        match credential {
            Some(secret) => {
                pace.before_sudo_password(self);
                self.send(StepLabel::SudoPassword, Input::Secret(secret.clone()));
                pace.after_sudo_password(self);
                true
            }
            None => {
                self.steps.push(Step::Abort(MISSING_SUDO_CREDENTIAL));
                false
            }
        }
    }
}

pub fn is_sudo_command(line: &str) -> bool {
    line.trim_start().starts_with("sudo")
}

/// How the plan waits between keystrokes: fixed sleeps, or prompts seen in output.
enum Pacing {
    Timed(Timings),
    Detected,
}

impl Pacing {
    fn before_passphrase(&self, plan: &mut Plan) {
        match self {
            Pacing::Timed(t) => plan.steps.push(Step::Pause(t.initial_delay)),
            Pacing::Detected => plan.steps.push(Step::WaitFor(Prompt::Passphrase)),
        }
    }

    fn after_login(&self, plan: &mut Plan) {
        if let Pacing::Timed(t) = self {
            plan.steps.push(Step::Pause(t.establish_delay));
        }
    }

    fn before_command(&self, plan: &mut Plan) {
        if let Pacing::Detected = self {
            plan.steps.push(Step::WaitFor(Prompt::Shell));
        }
    }

    fn after_command(&self, plan: &mut Plan) {
        if let Pacing::Timed(t) = self {
            plan.steps.push(Step::Pause(t.command_delay));
        }
    }

    fn before_sudo_password(&self, plan: &mut Plan) {
        match self {
            Pacing::Timed(t) => plan.steps.push(Step::Pause(t.sudo_prompt_delay)),
            Pacing::Detected => plan.steps.push(Step::WaitFor(Prompt::SudoPassword)),
        }
    }

    fn after_sudo_password(&self, plan: &mut Plan) {
        if let Pacing::Timed(t) = self {
            plan.steps.push(Step::Pause(t.sudo_prompt_delay));
        }
    }
}

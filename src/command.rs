use crate::profile::{ConnectionProfile, DEFAULT_SSH_PORT};

const SSH_PROGRAM: &str = "ssh";
const HOST_KEY_OPTION: &str = "StrictHostKeyChecking=no";

/// Builds the `ssh` invocation for a profile. Secrets never appear here; they
/// are typed into the live session after launch.
pub struct CommandBuilder<'a, S> {
    profile: &'a ConnectionProfile<S>,
}

impl<'a, S> CommandBuilder<'a, S> {
    pub fn new(profile: &'a ConnectionProfile<S>) -> Self {
        Self { profile }
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.profile.port != DEFAULT_SSH_PORT {
            args.push("-p".to_string());
            args.push(self.profile.port.to_string());
        }
        if let Some(key_path) = self.profile.key_path() {
            args.push("-i".to_string());
            args.push(key_path.to_string());
        }
        args.push(format!("{}@{}", self.profile.username, self.profile.host));
        args.push("-o".to_string());
        args.push(HOST_KEY_OPTION.to_string());
        args
    }

    /// Command line as typed into the shell.
    pub fn render(&self) -> String {
        let mut line = String::from(SSH_PROGRAM);
        for arg in self.args() {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{PlainProfile, SudoPolicy};

    #[test]
    fn default_port_omits_port_flag() {
        let profile = PlainProfile::new("web", "example.com", "bob").with_password("p1");
        assert_eq!(
            CommandBuilder::new(&profile).render(),
            "ssh bob@example.com -o StrictHostKeyChecking=no"
        );
    }

    #[test]
    fn custom_port_and_key() {
        let profile = PlainProfile::new("web", "host", "user")
            .with_port(2222)
            .with_public_key("/k");
        assert_eq!(
            CommandBuilder::new(&profile).render(),
            "ssh -p 2222 -i /k user@host -o StrictHostKeyChecking=no"
        );
    }

    #[test]
    fn key_flag_only_for_public_key_auth() {
        for port in [1u16, 22, 2222, 65535] {
            let password = PlainProfile::new("a", "h", "u").with_port(port);
            let args = CommandBuilder::new(&password).args();
            assert!(!args.contains(&"-i".to_string()));
            assert_eq!(args.contains(&"-p".to_string()), port != 22, "port {port}");

            let key = password.with_public_key("/home/u/.ssh/id_ed25519");
            let args = CommandBuilder::new(&key).args();
            let pos = args.iter().position(|arg| arg == "-i").expect("-i present");
            assert_eq!(args[pos + 1], "/home/u/.ssh/id_ed25519");
        }
    }

    #[test]
    fn secrets_never_rendered() {
        let profile = PlainProfile::new("web", "example.com", "bob")
            .with_password("s3cret-login")
            .with_public_key("/k")
            .with_key_passphrase("s3cret-phrase")
            .with_sudo(SudoPolicy::OwnPassword, Some("s3cret-sudo".into()));
        let line = CommandBuilder::new(&profile).render();
        assert!(!line.contains("s3cret"));
    }
}

#[cfg(feature = "os-keyring")]
macro_rules! secret_storage {
    () => {
        "os keychain"
    };
}

#[cfg(not(feature = "os-keyring"))]
macro_rules! secret_storage {
    () => {
        "no os keychain"
    };
}

const VERSION_WITH_GIT: &str = concat!(
    env!("SSHPILOT_VERSION_LABEL"),
    " (git ",
    env!("SSHPILOT_GIT_SHA"),
    ", built ",
    env!("SSHPILOT_BUILD_TIME"),
    ", ",
    secret_storage!(),
    ")",
);
const VERSION_NO_GIT: &str = concat!(
    env!("SSHPILOT_VERSION_LABEL"),
    " (built ",
    env!("SSHPILOT_BUILD_TIME"),
    ", ",
    secret_storage!(),
    ")",
);

/// Version string shown by `--version`, including the secret storage compiled in.
pub const VERSION: &str = if env!("SSHPILOT_GIT_SHA").is_empty() {
    VERSION_NO_GIT
} else {
    VERSION_WITH_GIT
};

//! `ssh` command construction and credential discovery.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::{BindMode, TunnelSpec, TunnelTarget};
use crate::error::TunnelError;

/// Private keys looked up under `~/.ssh`, in order.
pub const DEFAULT_KEY_NAMES: [&str; 3] = ["id_ed25519", "id_rsa", "id_ecdsa"];

/// Options passed to every session.
const SSH_OPTIONS: [&str; 6] = [
    "ServerAliveInterval=30",
    "ServerAliveCountMax=3",
    "TCPKeepAlive=yes",
    "ExitOnForwardFailure=yes",
    "StrictHostKeyChecking=no",
    "UserKnownHostsFile=/dev/null",
];

/// How sessions authenticate.
#[derive(Clone, PartialEq, Eq)]
pub enum SshAuth {
    /// A private key file.
    Key(PathBuf),
    /// A password, fed to `sshpass` through the environment.
    Password(String),
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(path) => f.debug_tuple("Key").field(path).finish(),
            Self::Password(_) => f.debug_tuple("Password").field(&"***").finish(),
        }
    }
}

impl SshAuth {
    /// Picks credentials: the configured key, then a default key under
    /// `~/.ssh`, then the password.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::NoCredentials`] when none is available.
    pub fn resolve(key_path: Option<&Path>, password: Option<&str>) -> Result<Self, TunnelError> {
        Self::resolve_in(dirs::home_dir().as_deref(), key_path, password)
    }

    /// Like [`SshAuth::resolve`], searching `home` instead of the user's
    /// home directory.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::NoCredentials`] when none is available.
    pub fn resolve_in(
        home: Option<&Path>,
        key_path: Option<&Path>,
        password: Option<&str>,
    ) -> Result<Self, TunnelError> {
        if let Some(key) = key_path.filter(|p| p.is_file()) {
            return Ok(Self::Key(key.to_path_buf()));
        }

        let discovered = home.and_then(|home| {
            DEFAULT_KEY_NAMES
                .iter()
                .map(|name| home.join(".ssh").join(name))
                .find(|path| path.is_file())
        });
        if let Some(key) = discovered {
            return Ok(Self::Key(key));
        }

        match password.filter(|p| !p.is_empty()) {
            Some(password) => Ok(Self::Password(password.to_string())),
            None => Err(TunnelError::NoCredentials),
        }
    }

    /// Reads the public half of a key pair, if there is one next to the key.
    #[must_use]
    pub fn public_key(&self) -> Option<String> {
        let Self::Key(path) = self else {
            return None;
        };
        let mut public = path.clone().into_os_string();
        public.push(".pub");
        std::fs::read_to_string(public)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }

    /// Short description for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Key(path) => format!("key {}", path.display()),
            Self::Password(_) => String::from("password (sshpass)"),
        }
    }
}

/// A fully built forwarding command.
#[derive(Clone, PartialEq, Eq)]
pub struct SshCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl SshCommand {
    /// Builds the command forwarding `spec` to `target`.
    #[must_use]
    pub fn forward(target: &TunnelTarget, spec: &TunnelSpec, bind: BindMode, auth: &SshAuth) -> Self {
        let mut args: Vec<String> = Vec::new();
        let mut env = Vec::new();

        let program = match auth {
            SshAuth::Key(_) => String::from("ssh"),
            SshAuth::Password(password) => {
                env.push((String::from("SSHPASS"), password.clone()));
                args.extend([String::from("-e"), String::from("ssh")]);
                String::from("sshpass")
            }
        };

        args.extend(["-N", "-T", "-4"].map(String::from));
        for option in SSH_OPTIONS {
            args.extend([String::from("-o"), option.to_string()]);
        }

        match auth {
            SshAuth::Key(path) => {
                args.extend([String::from("-i"), path.display().to_string()]);
                args.extend([String::from("-o"), String::from("BatchMode=yes")]);
            }
            SshAuth::Password(_) => {
                args.extend([
                    String::from("-o"),
                    String::from("PreferredAuthentications=password"),
                    String::from("-o"),
                    String::from("PubkeyAuthentication=no"),
                ]);
            }
        }

        args.extend([
            String::from("-L"),
            format!(
                "{}:{}:127.0.0.1:{}",
                bind.addr(),
                spec.local_port,
                spec.remote_port
            ),
            String::from("-p"),
            target.ssh_port.to_string(),
            format!("{}@{}", target.user, target.host),
        ]);

        Self { program, args, env }
    }

    /// Program to execute.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Extra environment variables.
    #[must_use]
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Converts into a process command with piped stderr and no stdin.
    #[must_use]
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl fmt::Display for SshCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

impl fmt::Debug for SshCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

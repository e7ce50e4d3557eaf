use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

/// What a spawned child gets on the stdio streams the channel does not use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioPolicy {
    /// Share the parent's stream.
    #[default]
    Inherit,
    /// Connect to `/dev/null`.
    Null,
}

impl StdioPolicy {
    fn to_stdio(self) -> Stdio {
        match self {
            StdioPolicy::Inherit => Stdio::inherit(),
            StdioPolicy::Null => Stdio::null(),
        }
    }
}

/// Description of the child process a server channel launches.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    unused_stdio: StdioPolicy,
}

impl ProcessSpec {
    /// Describe a child running `program`.
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            unused_stdio: StdioPolicy::default(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Working directory of the child.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Policy for stdio streams not claimed by the channel.
    pub fn unused_stdio(mut self, policy: StdioPolicy) -> Self {
        self.unused_stdio = policy;
        self
    }

    /// Program to run.
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Arguments configured by the caller, without channel handle arguments.
    pub fn configured_args(&self) -> &[OsString] {
        &self.args
    }

    /// Program name for messages.
    pub fn display_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Build the command with `leading` placed ahead of the configured arguments.
    pub(crate) fn command(&self, leading: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(leading)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(self.unused_stdio.to_stdio())
            .stdout(self.unused_stdio.to_stdio())
            .stderr(self.unused_stdio.to_stdio());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_args_come_first() {
        let spec = ProcessSpec::new("worker").arg("--verbose").args(["a", "b"]);
        let command = spec.command(&["7".to_string(), "-".to_string()]);

        let args: Vec<_> = command.get_args().collect();
        assert_eq!(args, ["7", "-", "--verbose", "a", "b"]);
        assert_eq!(command.get_program(), "worker");
    }

    #[test]
    fn env_and_dir_are_applied() {
        let spec = ProcessSpec::new("worker")
            .env("LINEPIPE_TEST", "1")
            .current_dir("/tmp");
        let command = spec.command(&[]);

        let envs: Vec<_> = command.get_envs().collect();
        assert_eq!(envs, [(OsStr::new("LINEPIPE_TEST"), Some(OsStr::new("1")))]);
        assert_eq!(command.get_current_dir(), Some(Path::new("/tmp")));
    }

    #[test]
    fn accessors() {
        let spec = ProcessSpec::new("/bin/echo").arg("x");
        assert_eq!(spec.program(), "/bin/echo");
        assert_eq!(spec.configured_args(), [OsString::from("x")]);
        assert_eq!(spec.display_name(), "/bin/echo");
    }
}

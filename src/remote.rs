use std::process::Command;

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub program: String,
    pub options: Vec<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            options: Vec::new(),
        }
    }
}

pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Clone)]
pub struct RemoteShell {
    settings: SshSettings,
}

impl RemoteShell {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    fn base(&self) -> Command {
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(&self.settings.options);
        cmd
    }

    pub fn command(&self, host: &str, port: Option<u16>, remote: &[String]) -> Command {
        let mut cmd = self.base();
        if let Some(port) = port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(host).arg("--").args(remote);
        cmd
    }

    pub fn tunnel_command(
        &self,
        host: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Command {
        let mut cmd = self.base();
        cmd.arg("-N")
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-L")
            .arg(format!("{}:{}:{}", local_port, remote_host, remote_port))
            .arg(host);
        cmd
    }

    pub fn transport(&self) -> String {
        std::iter::once(self.settings.program.as_str())
            .chain(self.settings.options.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::command::describe_command;

    fn shell() -> RemoteShell {
        RemoteShell::new(SshSettings {
            program: "ssh".to_string(),
            options: vec!["-i".to_string(), "/root/.ssh/backup key".to_string()],
        })
    }

    #[test]
    fn command_places_options_before_host() {
        let cmd = shell().command("backup@db1", Some(2222), &["ls".to_string(), "/srv".to_string()]);
        assert_eq!(
            describe_command(&cmd),
            "ssh -i /root/.ssh/backup key -p 2222 backup@db1 -- ls /srv"
        );
    }

    #[test]
    fn tunnel_forwards_local_port() {
        let cmd = RemoteShell::new(SshSettings::default()).tunnel_command("h", 8873, "localhost", 873);
        assert_eq!(
            describe_command(&cmd),
            "ssh -N -o ExitOnForwardFailure=yes -L 8873:localhost:873 h"
        );
    }

    #[test]
    fn transport_quotes_arguments() {
        assert_eq!(shell().transport(), "ssh -i '/root/.ssh/backup key'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}

/// Command execution on the node that hosts the consumer client.
///
/// A [`NodeAccount`] runs shell commands either on the local machine or over
/// ssh, streams their combined output line by line, and kills processes by
/// name. Every command is spawned in its own process group so a kill reaches
/// the whole pipeline, not just the wrapping shell.
use crate::config::NodeConfig;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, Command};

/// ssh reserves this exit status for its own failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// pkill exits with 1 when nothing matched.
const PKILL_NO_MATCH: i32 = 1;

/// How commands reach the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Local,
    Ssh {
        host: String,
        user: Option<String>,
        port: Option<u16>,
        ssh_command: String,
        options: Vec<String>,
    },
}

/// A machine allocated to run the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub transport: Transport,
}

impl Node {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: Transport::Local,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        let transport = match &config.host {
            None => Transport::Local,
            Some(host) => Transport::Ssh {
                host: host.clone(),
                user: config.user.clone(),
                port: config.port,
                ssh_command: config.ssh_command.clone(),
                options: config.ssh_options.clone(),
            },
        };
        Self {
            name: config.name.clone(),
            transport,
        }
    }
}

/// Errors from remote command execution.
#[derive(Debug)]
pub enum RemoteError {
    /// Failed to spawn the local side of the command.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Failed to read command output or wait for the command.
    Io { source: std::io::Error },
    /// ssh could not reach the node.
    Connection { host: String },
    /// Signalling a local process group failed.
    Signal { pgid: i32, source: Errno },
    /// A remote helper command exited unexpectedly.
    Command {
        command: String,
        exit_code: Option<i32>,
    },
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            RemoteError::Io { source } => write!(f, "I/O error on remote stream: {}", source),
            RemoteError::Connection { host } => write!(f, "ssh connection to {} failed", host),
            RemoteError::Signal { pgid, source } => {
                write!(f, "failed to signal process group {}: {}", pgid, source)
            }
            RemoteError::Command { command, exit_code } => {
                write!(f, "remote command {:?} exited with {:?}", command, exit_code)
            }
        }
    }
}

impl std::error::Error for RemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RemoteError::Spawn { source, .. } => Some(source),
            RemoteError::Io { source } => Some(source),
            RemoteError::Signal { source, .. } => Some(source),
            RemoteError::Connection { .. } | RemoteError::Command { .. } => None,
        }
    }
}

#[derive(Debug)]
struct SpawnedGroup {
    pgid: i32,
    command_line: String,
    /// Set once `kill_process` targeted this command.
    kill_requested: Arc<AtomicBool>,
}

type Registry = Arc<Mutex<Vec<SpawnedGroup>>>;

fn forget_group(registry: &Registry, pgid: i32) {
    let mut groups = registry.lock().unwrap_or_else(|e| e.into_inner());
    groups.retain(|g| g.pgid != pgid);
}

/// Shell access to one node.
#[derive(Debug)]
pub struct NodeAccount {
    node: Node,
    spawned: Registry,
}

impl NodeAccount {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            spawned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Build the local process that runs `command_line` on the node with
    /// stderr folded into stdout for the whole line.
    fn build_command(&self, command_line: &str) -> Command {
        let wrapped = format!("exec 2>&1; {command_line}");
        match &self.node.transport {
            Transport::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(wrapped);
                cmd
            }
            Transport::Ssh {
                ssh_command,
                options,
                port,
                ..
            } => {
                let mut cmd = Command::new(ssh_command);
                cmd.args(options);
                if let Some(port) = port {
                    cmd.arg("-p").arg(port.to_string());
                }
                cmd.arg(self.destination()).arg(wrapped);
                cmd
            }
        }
    }

    fn destination(&self) -> String {
        match &self.node.transport {
            Transport::Local => "localhost".to_string(),
            Transport::Ssh {
                host, user: None, ..
            } => host.clone(),
            Transport::Ssh {
                host,
                user: Some(user),
                ..
            } => format!("{user}@{host}"),
        }
    }

    fn ssh_host(&self) -> Option<String> {
        match &self.node.transport {
            Transport::Local => None,
            Transport::Ssh { host, .. } => Some(host.clone()),
        }
    }

    /// Run `command_line` on the node and stream its output line by line.
    pub fn ssh_capture(&self, command_line: &str) -> Result<LineStream, RemoteError> {
        let mut cmd = self.build_command(command_line);
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();

        tracing::info!(
            node = %self.node.name,
            command = %command_line,
            "starting streaming command"
        );

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::Spawn { program, source: e })?;

        let stdout = child.stdout.take().ok_or_else(|| RemoteError::Io {
            source: std::io::Error::other("child stdout was not captured"),
        })?;

        let pgid = child.id().map(|pid| pid as i32);
        let kill_requested = Arc::new(AtomicBool::new(false));
        if let Some(pgid) = pgid {
            tracing::debug!(pgid, "streaming command started");
            let mut groups = self.spawned.lock().unwrap_or_else(|e| e.into_inner());
            groups.push(SpawnedGroup {
                pgid,
                command_line: command_line.to_string(),
                kill_requested: Arc::clone(&kill_requested),
            });
        }

        Ok(LineStream {
            lines: (Box::new(BufReader::new(stdout)) as Box<dyn AsyncBufRead + Send + Unpin>)
                .lines(),
            process: Some(StreamProcess {
                child,
                pgid,
                registry: Arc::clone(&self.spawned),
                ssh_host: self.ssh_host(),
                kill_requested,
            }),
        })
    }

    /// Kill every process called `process_name` on the node.
    ///
    /// `clean_shutdown` selects SIGTERM over SIGKILL. Finding nothing to kill
    /// is not an error.
    pub async fn kill_process(
        &self,
        process_name: &str,
        clean_shutdown: bool,
    ) -> Result<(), RemoteError> {
        let signal = if clean_shutdown {
            Signal::SIGTERM
        } else {
            Signal::SIGKILL
        };
        tracing::info!(node = %self.node.name, process_name, %signal, "killing process");

        match &self.node.transport {
            Transport::Local => self.kill_local(process_name, signal),
            Transport::Ssh { .. } => self.kill_remote(process_name, signal).await,
        }
    }

    /// Mark the running commands that mention `process_name` as killed on
    /// request and return their process groups.
    fn request_kill(&self, process_name: &str) -> Vec<i32> {
        let groups = self.spawned.lock().unwrap_or_else(|e| e.into_inner());
        groups
            .iter()
            .filter(|g| g.command_line.contains(process_name))
            .map(|g| {
                g.kill_requested.store(true, Ordering::Release);
                g.pgid
            })
            .collect()
    }

    /// Signal the process groups this account spawned whose command line
    /// mentions `process_name`.
    fn kill_local(&self, process_name: &str, signal: Signal) -> Result<(), RemoteError> {
        let targets = self.request_kill(process_name);

        if targets.is_empty() {
            tracing::debug!(process_name, "no running process to kill");
        }

        for pgid in targets {
            match killpg(Pid::from_raw(pgid), signal) {
                Ok(()) => tracing::debug!(pgid, "signalled process group"),
                Err(Errno::ESRCH) => tracing::debug!(pgid, "process group already gone"),
                Err(e) => return Err(RemoteError::Signal { pgid, source: e }),
            }
        }
        Ok(())
    }

    async fn kill_remote(&self, process_name: &str, signal: Signal) -> Result<(), RemoteError> {
        // ssh reports a remote command killed by a signal as a failure of its own.
        self.request_kill(process_name);

        let sig = signal.as_str().trim_start_matches("SIG");
        let remote = format!("pkill -{sig} -x {}", shell_quote(process_name));
        let mut cmd = self.build_command(&remote);
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();

        let status = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .await
            .map_err(|e| RemoteError::Spawn { program, source: e })?;

        match status.code() {
            Some(0) => Ok(()),
            Some(PKILL_NO_MATCH) => {
                tracing::debug!(process_name, "no running process to kill");
                Ok(())
            }
            Some(SSH_CONNECTION_FAILURE) => Err(RemoteError::Connection {
                host: self.ssh_host().unwrap_or_default(),
            }),
            exit_code => Err(RemoteError::Command {
                command: remote,
                exit_code,
            }),
        }
    }
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

struct StreamProcess {
    child: Child,
    pgid: Option<i32>,
    registry: Registry,
    ssh_host: Option<String>,
    kill_requested: Arc<AtomicBool>,
}

/// Live, line-by-line output of a streaming command.
///
/// Dropping the stream before EOF kills the command's process group.
pub struct LineStream {
    lines: Lines<Box<dyn AsyncBufRead + Send + Unpin>>,
    process: Option<StreamProcess>,
}

impl std::fmt::Debug for LineStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineStream")
            .field("pgid", &self.process.as_ref().and_then(|p| p.pgid))
            .finish_non_exhaustive()
    }
}

impl LineStream {
    /// Stream lines from an in-memory or otherwise already-open reader.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        Self {
            lines: (Box::new(reader) as Box<dyn AsyncBufRead + Send + Unpin>).lines(),
            process: None,
        }
    }

    /// Next line without its terminator, or `None` once the command has
    /// closed its output and exited.
    pub async fn next_line(&mut self) -> Result<Option<String>, RemoteError> {
        match self.lines.next_line().await {
            Ok(Some(line)) => Ok(Some(line)),
            Ok(None) => {
                self.reap().await?;
                Ok(None)
            }
            Err(e) => Err(RemoteError::Io { source: e }),
        }
    }

    async fn reap(&mut self) -> Result<(), RemoteError> {
        let Some(mut process) = self.process.take() else {
            return Ok(());
        };
        if let Some(pgid) = process.pgid {
            forget_group(&process.registry, pgid);
        }

        let status = process
            .child
            .wait()
            .await
            .map_err(|e| RemoteError::Io { source: e })?;
        tracing::info!(exit_code = ?status.code(), "streaming command exited");

        match (&process.ssh_host, status.code()) {
            (Some(_), Some(SSH_CONNECTION_FAILURE))
                if process.kill_requested.load(Ordering::Acquire) =>
            {
                tracing::debug!("ssh exited after requested kill");
                Ok(())
            }
            (Some(host), Some(SSH_CONNECTION_FAILURE)) => Err(RemoteError::Connection {
                host: host.clone(),
            }),
            _ => Ok(()),
        }
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        let Some(process) = self.process.take() else {
            return;
        };
        if let Some(pgid) = process.pgid {
            forget_group(&process.registry, pgid);
            match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) => tracing::debug!(pgid, "killed abandoned streaming command"),
                Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!(pgid, error = %e, "failed to kill streaming command"),
            }
        }
        // `kill_on_drop` reaps the child when `process` goes out of scope.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ssh_node(user: Option<&str>, port: Option<u16>) -> Node {
        Node {
            name: "n1".to_string(),
            transport: Transport::Ssh {
                host: "10.1.2.3".to_string(),
                user: user.map(str::to_string),
                port,
                ssh_command: "ssh".to_string(),
                options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
            },
        }
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    async fn collect(stream: &mut LineStream) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = stream.next_line().await.unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_node_from_config_without_host_is_local() {
        let node = Node::from_config(&NodeConfig::default());
        assert_eq!(node.transport, Transport::Local);
        assert_eq!(node.name, "consumer-0");
    }

    #[test]
    fn test_node_from_config_with_host_is_ssh() {
        let config = NodeConfig {
            host: Some("db1".to_string()),
            user: Some("ops".to_string()),
            port: Some(2222),
            ..Default::default()
        };
        let node = Node::from_config(&config);
        match node.transport {
            Transport::Ssh {
                host, user, port, ..
            } => {
                assert_eq!(host, "db1");
                assert_eq!(user.as_deref(), Some("ops"));
                assert_eq!(port, Some(2222));
            }
            Transport::Local => panic!("expected ssh transport"),
        }
    }

    #[test]
    fn test_local_command_wraps_in_sh() {
        let account = NodeAccount::new(Node::local("n0"));
        let cmd = account.build_command("kaf consume t");
        assert_eq!(cmd.as_std().get_program(), "sh");
        assert_eq!(args_of(&cmd), vec!["-c", "exec 2>&1; kaf consume t"]);
    }

    #[test]
    fn test_ssh_command_with_user_and_port() {
        let account = NodeAccount::new(ssh_node(Some("ubuntu"), Some(2200)));
        let cmd = account.build_command("kaf consume t");
        assert_eq!(cmd.as_std().get_program(), "ssh");
        assert_eq!(
            args_of(&cmd),
            vec![
                "-o",
                "BatchMode=yes",
                "-p",
                "2200",
                "ubuntu@10.1.2.3",
                "exec 2>&1; kaf consume t"
            ]
        );
    }

    #[test]
    fn test_ssh_command_host_only() {
        let account = NodeAccount::new(ssh_node(None, None));
        let cmd = account.build_command("true");
        assert_eq!(
            args_of(&cmd),
            vec!["-o", "BatchMode=yes", "10.1.2.3", "exec 2>&1; true"]
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("kaf"), "'kaf'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_capture_local_lines_in_order() {
        let account = NodeAccount::new(Node::local("n0"));
        let mut stream = account
            .ssh_capture("printf 'one\\ntwo\\nthree\\n'")
            .unwrap();
        assert_eq!(collect(&mut stream).await, vec!["one", "two", "three"]);
        // EOF is sticky
        assert!(stream.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capture_merges_stderr() {
        let account = NodeAccount::new(Node::local("n0"));
        let mut stream = account
            .ssh_capture("echo err-first >&2; echo out-line; echo err-line >&2")
            .unwrap();
        assert_eq!(
            collect(&mut stream).await,
            vec!["err-first", "out-line", "err-line"]
        );
    }

    #[tokio::test]
    async fn test_nonzero_local_exit_is_not_an_error() {
        let account = NodeAccount::new(Node::local("n0"));
        let mut stream = account.ssh_capture("echo bye; exit 3").unwrap();
        assert_eq!(collect(&mut stream).await, vec!["bye"]);
    }

    #[tokio::test]
    async fn test_ssh_exit_255_is_connection_failure() {
        let node = Node {
            name: "n1".to_string(),
            transport: Transport::Ssh {
                host: "unreachable".to_string(),
                user: None,
                port: None,
                // Stand-in for ssh that fails the way ssh does.
                ssh_command: "sh".to_string(),
                options: vec!["-c".to_string(), "exit 255".to_string()],
            },
        };
        let account = NodeAccount::new(node);
        let mut stream = account.ssh_capture("kaf consume t").unwrap();
        let err = stream.next_line().await.unwrap_err();
        assert!(matches!(err, RemoteError::Connection { ref host } if host == "unreachable"));
    }

    #[tokio::test]
    async fn test_ssh_exit_255_after_kill_is_clean_end() {
        let dir = tempfile::tempdir().unwrap();
        let killed = dir.path().join("killed");
        // Stand-in for ssh: the streaming command runs until pkill arrives,
        // then exits 255 as OpenSSH does for a remote command killed by a signal.
        let fake_ssh = dir.path().join("ssh");
        std::fs::write(
            &fake_ssh,
            format!(
                "case \"$2\" in\n\
                 *pkill*) touch '{k}'; exit 0 ;;\n\
                 esac\n\
                 echo ready\n\
                 while [ ! -f '{k}' ]; do sleep 0.05; done\n\
                 exit 255\n",
                k = killed.display()
            ),
        )
        .unwrap();
        let node = Node {
            name: "n1".to_string(),
            transport: Transport::Ssh {
                host: "remote".to_string(),
                user: None,
                port: None,
                ssh_command: "sh".to_string(),
                options: vec![fake_ssh.display().to_string()],
            },
        };
        let account = NodeAccount::new(node);
        let mut stream = account.ssh_capture("kaf consume t").unwrap();
        assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("ready"));

        account.kill_process("kaf", false).await.unwrap();
        assert!(killed.exists());

        let end = tokio::time::timeout(Duration::from_secs(5), stream.next_line())
            .await
            .expect("stream should close after kill");
        assert!(end.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let node = Node {
            name: "n1".to_string(),
            transport: Transport::Ssh {
                host: "h".to_string(),
                user: None,
                port: None,
                ssh_command: "nonexistent-ssh-binary-xyz".to_string(),
                options: vec![],
            },
        };
        let account = NodeAccount::new(node);
        let err = account.ssh_capture("true").unwrap_err();
        assert!(matches!(err, RemoteError::Spawn { .. }));
        assert!(err.to_string().contains("nonexistent-ssh-binary-xyz"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_io_error() {
        let mut stream = LineStream::from_reader(&b"ok\n\xff\xfe\n"[..]);
        assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("ok"));
        let err = stream.next_line().await.unwrap_err();
        assert!(matches!(err, RemoteError::Io { .. }));
    }

    #[tokio::test]
    async fn test_kill_process_ends_stream() {
        let account = NodeAccount::new(Node::local("n0"));
        let mut stream = account
            .ssh_capture("echo ready; exec sleep 30 # fake-consumer")
            .unwrap();
        assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("ready"));

        account.kill_process("fake-consumer", false).await.unwrap();

        let end = tokio::time::timeout(Duration::from_secs(5), stream.next_line())
            .await
            .expect("stream should close after kill");
        assert!(end.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kill_process_only_matches_named_commands() {
        let account = NodeAccount::new(Node::local("n0"));
        let mut stream = account.ssh_capture("echo ready; exec sleep 30").unwrap();
        assert_eq!(stream.next_line().await.unwrap().as_deref(), Some("ready"));

        account.kill_process("something-else", false).await.unwrap();
        let still_running =
            tokio::time::timeout(Duration::from_millis(200), stream.next_line()).await;
        assert!(still_running.is_err());

        account.kill_process("sleep", false).await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), stream.next_line())
            .await
            .expect("stream should close after kill");
        assert!(end.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kill_process_with_nothing_running_is_noop() {
        let account = NodeAccount::new(Node::local("n0"));
        account.kill_process("kaf", false).await.unwrap();
        account.kill_process("kaf", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_noop() {
        let account = NodeAccount::new(Node::local("n0"));
        let mut stream = account.ssh_capture("echo done # kaf").unwrap();
        assert_eq!(collect(&mut stream).await, vec!["done"]);
        account.kill_process("kaf", false).await.unwrap();
    }
}

use super::{EngineBackend, EngineSession};
use crate::matchroom::EngineLevel;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const SEARCH_GRACE: Duration = Duration::from_secs(2);
const QUIT_GRACE: Duration = Duration::from_secs(1);

/// Launches a strength-limited UCI engine subprocess per session.
pub struct Stockfish {
    path: PathBuf,
}

impl Stockfish {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl EngineBackend for Stockfish {
    async fn open(&self, level: EngineLevel) -> anyhow::Result<Box<dyn EngineSession>> {
        let mut session = UciSession::launch(&self.path)?;
        session.handshake(level).await?;
        log::info!("opened engine session at elo {}", level);
        Ok(Box::new(session))
    }
}

/// A single UCI subprocess spoken to over stdin/stdout pipes.
/// The child is killed on drop as a backstop; `close` quits it politely.
pub struct UciSession {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl UciSession {
    fn launch(path: &Path) -> anyhow::Result<Self> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch engine at {}", path.display()))?;
        let stdin = child.stdin.take().context("engine stdin unavailable")?;
        let stdout = child.stdout.take().context("engine stdout unavailable")?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn handshake(&mut self, level: EngineLevel) -> anyhow::Result<()> {
        self.send("uci").await?;
        self.expect("uciok", HANDSHAKE_TIMEOUT).await?;
        self.send("setoption name UCI_LimitStrength value true").await?;
        self.send(&format!("setoption name UCI_Elo value {}", level)).await?;
        self.send("ucinewgame").await?;
        self.send("isready").await?;
        self.expect("readyok", HANDSHAKE_TIMEOUT).await?;
        Ok(())
    }

    async fn send(&mut self, line: &str) -> anyhow::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Reads output lines until one starts with `token`, returning that line.
    async fn expect(&mut self, token: &str, within: Duration) -> anyhow::Result<String> {
        let scan = async {
            loop {
                match self.stdout.next_line().await? {
                    Some(line) if line.starts_with(token) => return Ok(line),
                    Some(_) => continue,
                    None => anyhow::bail!("engine closed its output stream"),
                }
            }
        };
        tokio::time::timeout(within, scan)
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for {:?}", token))?
    }
}

#[async_trait::async_trait]
impl EngineSession for UciSession {
    async fn bestmove(&mut self, fen: &str, budget: Duration) -> anyhow::Result<String> {
        self.send(&format!("position fen {}", fen)).await?;
        self.send(&format!("go movetime {}", budget.as_millis())).await?;
        let line = self.expect("bestmove", budget + SEARCH_GRACE).await?;
        let best = line
            .split_whitespace()
            .nth(1)
            .context("engine returned an empty bestmove")?;
        anyhow::ensure!(best != "(none)", "engine found no move");
        Ok(best.to_string())
    }

    async fn close(&mut self) {
        let _ = self.send("quit").await;
        if tokio::time::timeout(QUIT_GRACE, self.child.wait()).await.is_err() {
            let _ = self.child.start_kill();
        }
    }
}

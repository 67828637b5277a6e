// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! In-memory login node used by unit tests across the crate.
//!
//! Speaks the sink (`scp -t`) and source (`scp -f`) halves of the SCP protocol,
//! handles `mkdir` and `rm`, serves SFTP stat/readdir from the same tree and
//! records every command it was asked to run. Anything else must be scripted
//! with [`FakeRemote::respond`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

use super::{ExecChannel, RemoteFileStat, RemoteSession, SessionConnector, SftpChannel};

#[derive(Debug, Clone)]
pub struct FakeFile {
    pub data: Vec<u8>,
    pub mode: u32,
}

struct Scripted {
    prefix: String,
    exit_code: i32,
    stdout: String,
}

#[derive(Default)]
struct FakeState {
    files: BTreeMap<String, FakeFile>,
    dirs: BTreeSet<String>,
    scripted: Vec<Scripted>,
    commands: Vec<String>,
    rejected_uploads: Vec<(String, u8, String)>,
    download_leading_zero: bool,
}

#[derive(Clone)]
pub struct FakeRemote {
    state: Arc<Mutex<FakeState>>,
    alive: Arc<AtomicBool>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parent_of(path: &str) -> String {
    match Path::new(path).parent() {
        Some(parent) => normalize(&parent.to_string_lossy()),
        None => "/".to_string(),
    }
}

/// Splits a command line the way a POSIX shell would for the quoting we emit.
pub fn shell_words(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut in_quote = false;
    let mut chars = command.chars();
    while let Some(c) = chars.next() {
        if in_quote {
            if c == '\'' {
                in_quote = false;
            } else {
                current.push(c);
            }
            continue;
        }
        match c {
            '\'' => {
                in_quote = true;
                in_word = true;
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

impl FakeRemote {
    pub fn new() -> Self {
        let mut state = FakeState::default();
        state.dirs.insert("/".to_string());
        Self {
            state: Arc::new(Mutex::new(state)),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Another connection to the same host: shared filesystem, own liveness.
    pub fn fresh_session(&self) -> Self {
        Self {
            state: self.state.clone(),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn respond(&self, prefix: &str, exit_code: i32, stdout: &str) {
        self.state.lock().unwrap().scripted.push(Scripted {
            prefix: prefix.to_string(),
            exit_code,
            stdout: stdout.to_string(),
        });
    }

    pub fn reject_uploads_to(&self, prefix: &str, code: u8, message: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_uploads
            .push((prefix.to_string(), code, message.to_string()));
    }

    pub fn send_leading_zero_on_download(&self) {
        self.state.lock().unwrap().download_leading_zero = true;
    }

    pub fn add_dir(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let mut current = normalize(path);
        loop {
            state.dirs.insert(current.clone());
            if current == "/" {
                break;
            }
            current = parent_of(&current);
        }
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        let path = normalize(path);
        self.add_dir(&parent_of(&path));
        self.state.lock().unwrap().files.insert(
            path,
            FakeFile {
                data: data.to_vec(),
                mode: 0o644,
            },
        );
    }

    pub fn file(&self, path: &str) -> Option<FakeFile> {
        self.state.lock().unwrap().files.get(&normalize(path)).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().unwrap().dirs.contains(&normalize(path))
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    fn run_builtin(state: &mut FakeState, words: &[String]) -> (i32, Vec<u8>) {
        match words.first().map(String::as_str) {
            Some("mkdir") => {
                let parents = words.iter().any(|w| w == "-p");
                let mut code = 0;
                for target in words.iter().skip(1).filter(|w| !w.starts_with('-')) {
                    let target = normalize(target);
                    if state.files.contains_key(&target) {
                        code = 1;
                        continue;
                    }
                    if parents {
                        let mut current = target;
                        loop {
                            state.dirs.insert(current.clone());
                            if current == "/" {
                                break;
                            }
                            current = parent_of(&current);
                        }
                    } else if state.dirs.contains(&parent_of(&target)) && !state.dirs.contains(&target) {
                        state.dirs.insert(target);
                    } else {
                        code = 1;
                    }
                }
                (code, Vec::new())
            }
            Some("rm") => {
                let flags: String = words
                    .iter()
                    .skip(1)
                    .filter(|w| w.starts_with('-'))
                    .map(|w| w.trim_start_matches('-'))
                    .collect();
                let recurse = flags.contains('r');
                let force = flags.contains('f');
                let mut code = 0;
                for target in words.iter().skip(1).filter(|w| !w.starts_with('-')) {
                    let target = normalize(target);
                    if state.files.remove(&target).is_some() {
                        continue;
                    }
                    if state.dirs.contains(&target) {
                        if !recurse {
                            code = 1;
                            continue;
                        }
                        let prefix = format!("{}/", target);
                        state.files.retain(|p, _| !p.starts_with(&prefix));
                        state.dirs.retain(|p| p != &target && !p.starts_with(&prefix));
                        continue;
                    }
                    if !force {
                        code = 1;
                    }
                }
                (code, Vec::new())
            }
            _ => (127, Vec::new()),
        }
    }
}

enum SinkState {
    Header(Vec<u8>),
    Data {
        target: String,
        mode: u32,
        size: usize,
        buf: Vec<u8>,
    },
    Trailer {
        target: String,
        mode: u32,
        data: Vec<u8>,
    },
    Done,
    Failed,
}

enum Mode {
    Plain,
    Sink { dest: String, state: SinkState },
}

struct FakeChannel {
    remote: Arc<Mutex<FakeState>>,
    output: VecDeque<u8>,
    mode: Mode,
    exit_code: i32,
}

impl FakeChannel {
    fn feed_sink(&mut self, bytes: &[u8]) {
        let Mode::Sink { dest, state } = &mut self.mode else {
            return;
        };
        for &byte in bytes {
            match state {
                SinkState::Header(line) => {
                    if byte != b'\n' {
                        line.push(byte);
                        continue;
                    }
                    let text = String::from_utf8_lossy(line).into_owned();
                    let parsed = text.strip_prefix('C').and_then(|rest| {
                        let mut parts = rest.splitn(3, ' ');
                        let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
                        let size = parts.next()?.parse::<usize>().ok()?;
                        let name = parts.next()?.to_string();
                        Some((mode, size, name))
                    });
                    let Some((mode, size, name)) = parsed else {
                        self.output.push_back(2);
                        self.output.extend(b"scp: protocol error\n");
                        *state = SinkState::Failed;
                        continue;
                    };
                    let remote = self.remote.lock().unwrap();
                    let target = if remote.dirs.contains(&normalize(dest)) {
                        format!("{}/{}", normalize(dest).trim_end_matches('/'), name)
                    } else {
                        normalize(dest)
                    };
                    drop(remote);
                    self.output.push_back(0);
                    *state = if size == 0 {
                        SinkState::Trailer {
                            target,
                            mode,
                            data: Vec::new(),
                        }
                    } else {
                        SinkState::Data {
                            target,
                            mode,
                            size,
                            buf: Vec::with_capacity(size),
                        }
                    };
                }
                SinkState::Data {
                    target,
                    mode,
                    size,
                    buf,
                } => {
                    buf.push(byte);
                    if buf.len() == *size {
                        *state = SinkState::Trailer {
                            target: std::mem::take(target),
                            mode: *mode,
                            data: std::mem::take(buf),
                        };
                    }
                }
                SinkState::Trailer { target, mode, data } => {
                    if byte != 0 {
                        self.output.push_back(2);
                        self.output.extend(b"scp: missing trailer\n");
                        *state = SinkState::Failed;
                        continue;
                    }
                    let mut remote = self.remote.lock().unwrap();
                    if !remote.dirs.contains(&parent_of(target)) {
                        self.output.push_back(1);
                        self.output
                            .extend(format!("scp: {target}: No such file or directory\n").as_bytes());
                        *state = SinkState::Failed;
                        continue;
                    }
                    remote.files.insert(
                        target.clone(),
                        FakeFile {
                            data: std::mem::take(data),
                            mode: *mode,
                        },
                    );
                    self.output.push_back(0);
                    *state = SinkState::Done;
                }
                SinkState::Done | SinkState::Failed => {}
            }
        }
    }
}

#[async_trait]
impl ExecChannel for FakeChannel {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.feed_sink(data);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.output.len());
        for (slot, byte) in buf.iter_mut().zip(self.output.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn finish(self: Box<Self>) -> Result<i32> {
        match &self.mode {
            Mode::Sink { state, .. } => Ok(match state {
                SinkState::Done => 0,
                _ => 1,
            }),
            Mode::Plain => Ok(self.exit_code),
        }
    }
}

struct FakeSftp {
    state: Arc<Mutex<FakeState>>,
}

fn stat_entry(state: &FakeState, path: &str) -> Option<RemoteFileStat> {
    let path = normalize(path);
    if let Some(file) = state.files.get(&path) {
        return Some(RemoteFileStat {
            path,
            size: file.data.len() as u64,
            is_dir: false,
            permissions: Some(file.mode),
            modified_at: None,
        });
    }
    if state.dirs.contains(&path) {
        return Some(RemoteFileStat {
            path,
            size: 0,
            is_dir: true,
            permissions: Some(0o755),
            modified_at: None,
        });
    }
    None
}

#[async_trait]
impl SftpChannel for FakeSftp {
    async fn stat(&self, path: &str) -> Result<Option<RemoteFileStat>> {
        Ok(stat_entry(&self.state.lock().unwrap(), path))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteFileStat>> {
        let state = self.state.lock().unwrap();
        let path = normalize(path);
        if !state.dirs.contains(&path) {
            bail!("no such directory: {path}");
        }
        let children: BTreeSet<&String> = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter(|p| p.as_str() != "/" && parent_of(p) == path)
            .collect();
        Ok(children
            .into_iter()
            .filter_map(|p| stat_entry(&state, p))
            .collect())
    }
}

#[async_trait]
impl RemoteSession for FakeRemote {
    async fn exec(&self, command: &str) -> Result<Box<dyn ExecChannel>> {
        if !self.is_alive() {
            return Err(anyhow!("session closed"));
        }
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());

        let scripted = state
            .scripted
            .iter()
            .rev()
            .find(|s| command.starts_with(&s.prefix))
            .map(|s| (s.exit_code, s.stdout.clone().into_bytes()));
        let words = shell_words(command);
        let mut channel = FakeChannel {
            remote: self.state.clone(),
            output: VecDeque::new(),
            mode: Mode::Plain,
            exit_code: 0,
        };

        if let Some((exit_code, stdout)) = scripted {
            channel.exit_code = exit_code;
            channel.output.extend(stdout);
        } else if words.first().map(String::as_str) == Some("scp") && words.iter().any(|w| w == "-t") {
            let dest = words.last().cloned().unwrap_or_default();
            let rejection = state
                .rejected_uploads
                .iter()
                .find(|(prefix, _, _)| dest.starts_with(prefix.as_str()))
                .cloned();
            let sink_state = match rejection {
                Some((_, code, message)) => {
                    channel.output.push_back(code);
                    channel.output.extend(format!("{message}\n").as_bytes());
                    SinkState::Failed
                }
                None => {
                    channel.output.push_back(0);
                    SinkState::Header(Vec::new())
                }
            };
            channel.mode = Mode::Sink {
                dest,
                state: sink_state,
            };
        } else if words.first().map(String::as_str) == Some("scp") && words.iter().any(|w| w == "-f") {
            let source = normalize(words.last().map(String::as_str).unwrap_or("/"));
            match state.files.get(&source) {
                Some(file) => {
                    if state.download_leading_zero {
                        channel.output.push_back(0);
                    }
                    let name = Path::new(&source)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    channel
                        .output
                        .extend(format!("C{:04o} {} {}\n", file.mode, file.data.len(), name).as_bytes());
                    channel.output.extend(file.data.iter().copied());
                    channel.output.push_back(0);
                    channel.exit_code = 0;
                }
                None => {
                    channel.output.push_back(1);
                    channel
                        .output
                        .extend(format!("scp: {source}: No such file or directory\n").as_bytes());
                    channel.exit_code = 1;
                }
            }
        } else {
            let (exit_code, stdout) = Self::run_builtin(&mut state, &words);
            channel.exit_code = exit_code;
            channel.output.extend(stdout);
        }
        Ok(Box::new(channel))
    }

    async fn open_sftp(&self) -> Result<Box<dyn SftpChannel>> {
        if !self.is_alive() {
            return Err(anyhow!("session closed"));
        }
        Ok(Box::new(FakeSftp {
            state: self.state.clone(),
        }))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Hands out fresh sessions to one shared [`FakeRemote`] host.
pub struct FakeConnector {
    host: FakeRemote,
    connects: AtomicUsize,
    fail: AtomicBool,
    stall: AtomicBool,
    issued: Mutex<Vec<FakeRemote>>,
}

impl FakeConnector {
    pub fn new(host: FakeRemote) -> Self {
        Self {
            host,
            connects: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            stall: AtomicBool::new(false),
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// While set, `connect` never completes.
    pub fn set_stalling(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    pub fn issued(&self) -> Vec<FakeRemote> {
        self.issued.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteSession>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let session = self.host.fresh_session();
        self.issued.lock().unwrap().push(session.clone());
        Ok(Arc::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::shell_words;

    #[test]
    fn shell_words_undo_escaping() {
        let words = shell_words(r"rm -r -f 'it'\''s here'");
        assert_eq!(words, vec!["rm", "-r", "-f", "it's here"]);
    }
}

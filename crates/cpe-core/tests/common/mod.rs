//! Test doubles and common utilities for architecture contract tests
//!
//! These doubles record what the core asked of the host and the controller
//! so contract tests can assert on exact command sequences and pushes.

#![allow(dead_code)]

use async_trait::async_trait;
use cpe_core::config::{AgentConfig, HostPaths};
use cpe_core::error::{Error, Result};
use cpe_core::port_map::{PortEntry, PortMap};
use cpe_core::traits::{CommandExecutor, ConfigRenderer, ConfigStore, ControllerClient};
use cpe_core::{AgentHealth, MemoryConfigStore, ReconcileContext};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Records every command and answers from a script
///
/// A scripted entry matches when the command contains its pattern; the
/// most recently added match wins. Unmatched commands succeed with empty
/// output.
///
/// With [`MockExecutor::emulate_iptables`] the executor keeps a rule table
/// instead: `-C` succeeds only for installed rules, `-A`/`-I` install (even
/// a duplicate) and `-D` removes one copy.
#[derive(Default)]
pub struct MockExecutor {
    commands: Mutex<Vec<String>>,
    script: Mutex<Vec<(String, std::result::Result<String, String>)>>,
    iptables: Mutex<Option<Vec<String>>>,
}

/// Split an iptables command into its operation flag and the rule it names
fn iptables_rule(command: &str) -> Option<(&str, String)> {
    if !command.starts_with("iptables") {
        return None;
    }
    let mut tokens: Vec<&str> = command.split_whitespace().collect();
    let pos = tokens
        .iter()
        .position(|t| matches!(*t, "-C" | "-A" | "-I" | "-D"))?;
    let flag = tokens.remove(pos);
    Some((flag, tokens.join(" ")))
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `stdout`
    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.script
            .lock()
            .unwrap()
            .push((pattern.to_string(), Ok(stdout.to_string())));
    }

    /// Fail commands containing `pattern` with `stderr`
    pub fn fail(&self, pattern: &str, stderr: &str) {
        self.script
            .lock()
            .unwrap()
            .push((pattern.to_string(), Err(stderr.to_string())));
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Commands containing `needle`
    pub fn matching(&self, needle: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }

    /// Commands that mutate the host, ignoring probes and `-C` checks
    pub fn mutations(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| !c.contains(" -C ") && !c.starts_with("ip -4 addr show") && !c.starts_with("ip route show"))
            .collect()
    }

    pub fn clear(&self) {
        self.commands.lock().unwrap().clear();
    }

    /// Track iptables rules statefully from now on
    pub fn emulate_iptables(&self) {
        *self.iptables.lock().unwrap() = Some(Vec::new());
    }

    /// Rules currently installed, duplicates included
    pub fn installed_rules(&self) -> Vec<String> {
        self.iptables.lock().unwrap().clone().unwrap_or_default()
    }

    /// Issued commands that append or insert an iptables rule
    pub fn rule_inserts(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| matches!(iptables_rule(c), Some(("-A" | "-I", _))))
            .collect()
    }
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn run(&self, command: &str) -> Result<String> {
        self.commands.lock().unwrap().push(command.to_string());
        if let Some(rules) = self.iptables.lock().unwrap().as_mut() {
            if let Some((flag, rule)) = iptables_rule(command) {
                return match flag {
                    "-C" if rules.contains(&rule) => Ok(String::new()),
                    "-C" => Err(Error::command(command, "Bad rule (does a matching rule exist in that chain?)")),
                    "-D" => {
                        if let Some(pos) = rules.iter().position(|r| *r == rule) {
                            rules.remove(pos);
                        }
                        Ok(String::new())
                    }
                    _ => {
                        rules.push(rule);
                        Ok(String::new())
                    }
                };
            }
        }
        let script = self.script.lock().unwrap();
        match script.iter().rev().find(|(p, _)| command.contains(p.as_str())) {
            Some((_, Ok(out))) => Ok(out.clone()),
            Some((_, Err(stderr))) => Err(Error::command(command, stderr.clone())),
            None => Ok(String::new()),
        }
    }
}

/// In-memory filesystem
#[derive(Default)]
pub struct MemoryRenderer {
    files: Mutex<BTreeMap<PathBuf, String>>,
    dirs: Mutex<BTreeSet<PathBuf>>,
}

impl MemoryRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: impl Into<PathBuf>, contents: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.into(), contents.to_string());
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<String> {
        self.files.lock().unwrap().get(path.as_ref()).cloned()
    }

    pub fn has(&self, path: impl AsRef<Path>) -> bool {
        self.files.lock().unwrap().contains_key(path.as_ref())
    }
}

#[async_trait]
impl ConfigRenderer for MemoryRenderer {
    async fn write(&self, path: &Path, contents: &str) -> Result<()> {
        self.put(path, contents);
        Ok(())
    }

    async fn append(&self, path: &Path, contents: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default()
            .push_str(contents);
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.get(path))
    }

    async fn exists(&self, path: &Path) -> bool {
        self.has(path) || self.dirs.lock().unwrap().contains(path)
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn touch(&self, path: &Path) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default();
        Ok(())
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        self.dirs.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        self.dirs.lock().unwrap().remove(path);
        self.files.lock().unwrap().retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect())
    }
}

/// Records every controller call
///
/// PUTs fail while `put_failures` is positive, decrementing it each time.
#[derive(Default)]
pub struct MockController {
    puts: Mutex<Vec<(String, Value)>>,
    gets: Mutex<Vec<String>>,
    get_reply: Mutex<Value>,
    put_reply: Mutex<Value>,
    put_failures: AtomicUsize,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_puts(&self, n: usize) {
        self.put_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_get_reply(&self, data: Value) {
        *self.get_reply.lock().unwrap() = data;
    }

    pub fn set_put_reply(&self, data: Value) {
        *self.put_reply.lock().unwrap() = data;
    }

    pub fn puts(&self) -> Vec<(String, Value)> {
        self.puts.lock().unwrap().clone()
    }

    pub fn puts_to(&self, suffix: &str) -> Vec<Value> {
        self.puts()
            .into_iter()
            .filter(|(p, _)| p.ends_with(suffix))
            .map(|(_, v)| v)
            .collect()
    }

    pub fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControllerClient for MockController {
    async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.puts
            .lock()
            .unwrap()
            .push((path.to_string(), body.clone()));
        let remaining = self.put_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.put_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::controller("scripted failure"));
        }
        Ok(self.put_reply.lock().unwrap().clone())
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.gets.lock().unwrap().push(path.to_string());
        Ok(self.get_reply.lock().unwrap().clone())
    }
}

/// Everything a contract test needs, wired together
pub struct Harness {
    pub config: AgentConfig,
    pub store: Arc<MemoryConfigStore>,
    pub exec: Arc<MockExecutor>,
    pub files: Arc<MemoryRenderer>,
    pub controller: Arc<MockController>,
    pub health: Arc<AgentHealth>,
    pub ctx: ReconcileContext,
}

/// Port map with `wan1 → eth0` and `lan1 → eth1`
pub fn port_map() -> PortMap {
    PortMap {
        wans: vec![PortEntry {
            name: "wan1".into(),
            device: "eth0".into(),
        }],
        lans: vec![PortEntry {
            name: "lan1".into(),
            device: "eth1".into(),
        }],
    }
}

impl Harness {
    pub fn new() -> Self {
        let mut config = AgentConfig::for_serial("SN0001");
        config.paths = HostPaths::rooted_at("/test");

        let store = Arc::new(MemoryConfigStore::new());
        let exec = Arc::new(MockExecutor::new());
        let files = Arc::new(MemoryRenderer::new());
        let controller = Arc::new(MockController::new());
        let health = Arc::new(AgentHealth::new());

        // Both mapped interfaces resolve through sysfs
        for dev in ["eth0", "eth1"] {
            files.put(config.paths.sys_class_net.join(dev).join("address"), "00:00:00:00:00:00\n");
        }

        let ctx = ReconcileContext::new(
            &config,
            store.clone() as Arc<dyn ConfigStore>,
            exec.clone() as Arc<dyn CommandExecutor>,
            files.clone() as Arc<dyn ConfigRenderer>,
            Arc::new(port_map()),
            health.clone(),
        );

        Self {
            config,
            store,
            exec,
            files,
            controller,
            health,
            ctx,
        }
    }
}

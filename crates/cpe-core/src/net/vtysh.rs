//! FRR routing CLI scripts
//!
//! One `vtysh` invocation carries a whole script as repeated `-c` lines:
//!
//! ```text
//! /bin/vtysh -c "configure terminal" -c "ip route 10.1.0.0/24 192.168.1.1" -c "do write"
//! ```
//!
//! Lines are escaped for the double quotes they sit in, so operator supplied
//! values such as BGP passwords reach vtysh verbatim.
//!
//! Route lists are split into batches so a subnet with hundreds of prefixes
//! does not turn into hundreds of process spawns. Each batch is committed on
//! its own; a failed batch does not undo earlier ones.

use tracing::{debug, warn};

use crate::Result;
use crate::traits::CommandExecutor;

pub const VTYSH: &str = "/bin/vtysh";

/// Escape what `sh` still expands inside double quotes; control characters are dropped
fn quote(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for c in line.chars() {
        if c.is_control() {
            continue;
        }
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Builder for a single vtysh invocation
#[derive(Debug, Clone, Default)]
pub struct VtyshScript {
    lines: Vec<String>,
}

impl VtyshScript {
    /// Start a script in configuration mode
    pub fn configure() -> Self {
        Self {
            lines: vec!["configure terminal".to_string()],
        }
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Add `line`, or its `no` form when `negate` is set
    pub fn toggle(&mut self, negate: bool, line: impl AsRef<str>) {
        if negate {
            self.lines.push(format!("no {}", line.as_ref()));
        } else {
            self.lines.push(line.as_ref().to_string());
        }
    }

    /// Number of lines after `configure terminal`
    pub fn body_len(&self) -> usize {
        self.lines.len().saturating_sub(1)
    }

    /// Render the shell command, committing with `do write`
    pub fn render(&self) -> String {
        let mut cmd = String::from(VTYSH);
        for line in self
            .lines
            .iter()
            .map(String::as_str)
            .chain(std::iter::once("do write"))
        {
            cmd.push_str(" -c \"");
            cmd.push_str(&quote(line));
            cmd.push('"');
        }
        cmd
    }

    pub async fn run(&self, exec: &dyn CommandExecutor) -> Result<String> {
        let cmd = self.render();
        debug!(lines = self.body_len(), "vtysh script");
        exec.run(&cmd).await
    }
}

/// `ip route <prefix> <nexthop>` line
pub fn route_line(prefix: &str, nexthop: &str) -> String {
    format!("ip route {} {}", prefix, nexthop)
}

/// `ip route <prefix> <nexthop> table <table>` line
pub fn table_route_line(prefix: &str, nexthop: &str, table: u32) -> String {
    format!("ip route {} {} table {}", prefix, nexthop, table)
}

/// Add or remove one route
pub async fn route(exec: &dyn CommandExecutor, remove: bool, prefix: &str, nexthop: &str) -> Result<()> {
    let mut script = VtyshScript::configure();
    script.toggle(remove, route_line(prefix, nexthop));
    script.run(exec).await?;
    Ok(())
}

/// Move one route from `old` to `new` nexthop
pub async fn route_replace(exec: &dyn CommandExecutor, prefix: &str, old: &str, new: &str) -> Result<()> {
    let mut script = VtyshScript::configure();
    script.toggle(true, route_line(prefix, old));
    script.toggle(false, route_line(prefix, new));
    script.run(exec).await?;
    Ok(())
}

/// Add or remove one route in a policy table
pub async fn table_route(
    exec: &dyn CommandExecutor,
    remove: bool,
    prefix: &str,
    nexthop: &str,
    table: u32,
) -> Result<()> {
    let mut script = VtyshScript::configure();
    script.toggle(remove, table_route_line(prefix, nexthop, table));
    script.run(exec).await?;
    Ok(())
}

pub async fn table_route_replace(
    exec: &dyn CommandExecutor,
    prefix: &str,
    old: &str,
    new: &str,
    table: u32,
) -> Result<()> {
    let mut script = VtyshScript::configure();
    script.toggle(true, table_route_line(prefix, old, table));
    script.toggle(false, table_route_line(prefix, new, table));
    script.run(exec).await?;
    Ok(())
}

/// Add or remove a list of prefixes via one nexthop, `batch` prefixes per call
///
/// Every batch is attempted; the first error is returned after all batches ran.
pub async fn route_batch(
    exec: &dyn CommandExecutor,
    remove: bool,
    prefixes: &[String],
    nexthop: &str,
    batch: usize,
) -> Result<()> {
    let prefixes: Vec<&String> = prefixes.iter().filter(|p| !p.is_empty()).collect();
    let mut first_err = None;
    for chunk in prefixes.chunks(batch.max(1)) {
        let mut script = VtyshScript::configure();
        for prefix in chunk {
            script.toggle(remove, route_line(prefix, nexthop));
        }
        if let Err(e) = script.run(exec).await {
            warn!(error = %e, count = chunk.len(), remove, "route batch failed");
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// Move a list of prefixes from `old` to `new` nexthop, `batch` prefixes per call
pub async fn route_batch_replace(
    exec: &dyn CommandExecutor,
    prefixes: &[String],
    old: &str,
    new: &str,
    batch: usize,
) -> Result<()> {
    let prefixes: Vec<&String> = prefixes.iter().filter(|p| !p.is_empty()).collect();
    let mut first_err = None;
    for chunk in prefixes.chunks(batch.max(1)) {
        let mut script = VtyshScript::configure();
        for prefix in chunk {
            script.toggle(true, route_line(prefix, old));
            script.toggle(false, route_line(prefix, new));
        }
        if let Err(e) = script.run(exec).await {
            warn!(error = %e, count = chunk.len(), "route replace batch failed");
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl CommandExecutor for Recorder {
        async fn run(&self, command: &str) -> Result<String> {
            self.0.lock().unwrap().push(command.to_string());
            Ok(String::new())
        }
    }

    #[test]
    fn render_quotes_every_line_and_commits() {
        let script = VtyshScript::configure().line("router bgp 65001");
        assert_eq!(
            script.render(),
            "/bin/vtysh -c \"configure terminal\" -c \"router bgp 65001\" -c \"do write\""
        );
    }

    #[test]
    fn render_escapes_shell_metacharacters() {
        let script = VtyshScript::configure().line("neighbor 10.0.0.2 password a\"b$c`d\\e\nf");
        assert_eq!(
            script.render(),
            r#"/bin/vtysh -c "configure terminal" -c "neighbor 10.0.0.2 password a\"b\$c\`d\\ef" -c "do write""#
        );
    }

    #[tokio::test]
    async fn batches_split_at_limit() {
        let exec = Recorder::default();
        let prefixes: Vec<String> = (0..250).map(|i| format!("10.{}.0.0/24", i)).collect();
        route_batch(&exec, false, &prefixes, "192.168.1.1", 100)
            .await
            .unwrap();

        let calls = exec.0.lock().unwrap();
        assert_eq!(calls.len(), 3, "Expected 3 batches, got {}", calls.len());
        assert_eq!(calls[0].matches("ip route").count(), 100);
        assert_eq!(calls[2].matches("ip route").count(), 50);
    }

    #[tokio::test]
    async fn replace_emits_pairs() {
        let exec = Recorder::default();
        let prefixes: Vec<String> = (0..60).map(|i| format!("10.{}.0.0/24", i)).collect();
        route_batch_replace(&exec, &prefixes, "1.1.1.1", "2.2.2.2", 50)
            .await
            .unwrap();

        let calls = exec.0.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].matches("no ip route").count(), 50);
        assert_eq!(calls[0].matches("2.2.2.2").count(), 50);
    }
}

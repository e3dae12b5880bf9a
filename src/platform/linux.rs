//! Linux implementation backed by the standard networking tools

use super::{
    Family, FilterRule, FilterTable, FwmarkRule, IpSets, KernelParams, LinkControl,
    NameResolver, PacketFilter, PlatformError, PolicyRoutes,
};
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Messages the tools print when the target of a delete/query is missing
const ABSENT_MARKERS: &[&str] = &[
    "does not exist",
    "no such file or directory",
    "no chain/target/match by that name",
    "does a matching rule exist",
    "cannot find device",
    "is not a wireguard interface",
    "no such process",
];

const PRESENT_MARKERS: &[&str] = &["already exists", "already added", "file exists"];

#[derive(Debug, Clone)]
pub struct LinuxNetwork {
    timeout: Duration,
}

impl LinuxNetwork {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run a command to completion within the timeout, returning stdout
    fn run(&self, program: &str, args: &[&str]) -> Result<String, PlatformError> {
        let command = format!("{} {}", program, args.join(" "));
        debug!("exec: {}", command);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PlatformError::SpawnError {
                program: program.to_string(),
                source,
            })?;

        // drained while waiting; a tool blocked on a full pipe never exits
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            let exited = child.try_wait().map_err(|source| PlatformError::SpawnError {
                program: program.to_string(),
                source,
            })?;
            if let Some(status) = exited {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PlatformError::Timeout {
                    command,
                    secs: self.timeout.as_secs(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = collect(stdout);
        if status.success() {
            return Ok(String::from_utf8_lossy(&stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&collect(stderr)).trim().to_string();
        Err(classify_failure(command, stderr))
    }

    fn run_quiet(&self, program: &str, args: &[&str]) -> Result<(), PlatformError> {
        self.run(program, args).map(|_| ())
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader.and_then(|r| r.join().ok()).unwrap_or_default()
}

fn classify_failure(command: String, stderr: String) -> PlatformError {
    let lower = stderr.to_ascii_lowercase();
    if ABSENT_MARKERS.iter().any(|m| lower.contains(m)) {
        PlatformError::Absent(command)
    } else if PRESENT_MARKERS.iter().any(|m| lower.contains(m)) {
        PlatformError::AlreadyPresent(command)
    } else {
        PlatformError::CommandFailed { command, stderr }
    }
}

fn ip_program(family: Family) -> &'static str {
    match family {
        Family::V4 => "iptables",
        Family::V6 => "ip6tables",
    }
}

fn ip_family_flag(family: Family) -> &'static str {
    match family {
        Family::V4 => "-4",
        Family::V6 => "-6",
    }
}

impl LinkControl for LinuxNetwork {
    fn up(&self, config: &Path) -> Result<(), PlatformError> {
        let path = config.to_string_lossy();
        self.run_quiet("wg-quick", &["up", path.as_ref()])
    }

    fn down(&self, config: &Path) -> Result<(), PlatformError> {
        let path = config.to_string_lossy();
        self.run_quiet("wg-quick", &["down", path.as_ref()])
    }

    fn exists(&self, interface: &str) -> Result<bool, PlatformError> {
        match self.run("ip", &["link", "show", "dev", interface]) {
            Ok(_) => Ok(true),
            Err(e) if e.is_absent() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl PolicyRoutes for LinuxNetwork {
    fn add_rule(&self, family: Family, rule: &FwmarkRule) -> Result<(), PlatformError> {
        let (mark, table, priority) = rule_args(rule);
        self.run_quiet(
            "ip",
            &[
                ip_family_flag(family),
                "rule",
                "add",
                "fwmark",
                mark.as_str(),
                "table",
                table.as_str(),
                "priority",
                priority.as_str(),
            ],
        )
    }

    fn delete_rule(&self, family: Family, rule: &FwmarkRule) -> Result<(), PlatformError> {
        let (mark, table, priority) = rule_args(rule);
        self.run_quiet(
            "ip",
            &[
                ip_family_flag(family),
                "rule",
                "delete",
                "fwmark",
                mark.as_str(),
                "table",
                table.as_str(),
                "priority",
                priority.as_str(),
            ],
        )
    }

    fn flush_table(&self, family: Family, table: u32) -> Result<(), PlatformError> {
        let table = table.to_string();
        self.run_quiet(
            "ip",
            &[ip_family_flag(family), "route", "flush", "table", table.as_str()],
        )
    }

    fn replace_route(
        &self,
        family: Family,
        table: u32,
        network: &str,
        interface: &str,
    ) -> Result<(), PlatformError> {
        let table = table.to_string();
        self.run_quiet(
            "ip",
            &[
                ip_family_flag(family),
                "route",
                "replace",
                "table",
                table.as_str(),
                network,
                "dev",
                interface,
            ],
        )
    }
}

fn rule_args(rule: &FwmarkRule) -> (String, String, String) {
    (
        rule.mark.to_string(),
        rule.table.to_string(),
        rule.priority.to_string(),
    )
}

impl PacketFilter for LinuxNetwork {
    fn create_chain(
        &self,
        family: Family,
        table: FilterTable,
        chain: &str,
    ) -> Result<(), PlatformError> {
        self.run_quiet(ip_program(family), &["-t", table.as_str(), "-N", chain])
    }

    fn flush_chain(
        &self,
        family: Family,
        table: FilterTable,
        chain: &str,
    ) -> Result<(), PlatformError> {
        self.run_quiet(ip_program(family), &["-t", table.as_str(), "-F", chain])
    }

    fn delete_chain(
        &self,
        family: Family,
        table: FilterTable,
        chain: &str,
    ) -> Result<(), PlatformError> {
        self.run_quiet(ip_program(family), &["-t", table.as_str(), "-X", chain])
    }

    fn append(
        &self,
        family: Family,
        table: FilterTable,
        chain: &str,
        rule: &FilterRule,
    ) -> Result<(), PlatformError> {
        let spec = rule.args();
        let mut args = vec!["-t", table.as_str(), "-A", chain];
        args.extend(spec.iter().map(String::as_str));
        self.run_quiet(ip_program(family), &args)
    }

    fn delete(
        &self,
        family: Family,
        table: FilterTable,
        chain: &str,
        rule: &FilterRule,
    ) -> Result<(), PlatformError> {
        let spec = rule.args();
        let mut args = vec!["-t", table.as_str(), "-D", chain];
        args.extend(spec.iter().map(String::as_str));
        self.run_quiet(ip_program(family), &args)
    }
}

impl IpSets for LinuxNetwork {
    fn create(&self, name: &str, family: Family) -> Result<(), PlatformError> {
        self.run_quiet(
            "ipset",
            &["create", name, "hash:net", "family", family.ipset_family(), "-exist"],
        )
    }

    fn flush(&self, name: &str) -> Result<(), PlatformError> {
        self.run_quiet("ipset", &["flush", name])
    }

    fn add(&self, name: &str, entry: &str) -> Result<(), PlatformError> {
        self.run_quiet("ipset", &["add", name, entry])
    }

    fn destroy(&self, name: &str) -> Result<(), PlatformError> {
        self.run_quiet("ipset", &["destroy", name])
    }

    fn exists(&self, name: &str) -> Result<bool, PlatformError> {
        match self.run("ipset", &["list", "-n", name]) {
            Ok(_) => Ok(true),
            Err(e) if e.is_absent() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl KernelParams for LinuxNetwork {
    fn set(&self, key: &str, value: &str) -> Result<(), PlatformError> {
        let assignment = format!("{key}={value}");
        self.run_quiet("sysctl", &["-w", assignment.as_str()])
    }
}

impl NameResolver for LinuxNetwork {
    fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>, PlatformError> {
        let output = self.run("getent", &["ahosts", domain])?;
        Ok(parse_ahosts(&output))
    }
}

/// Addresses from `getent ahosts` output, first occurrence order
fn parse_ahosts(output: &str) -> Vec<IpAddr> {
    let mut addrs: Vec<IpAddr> = Vec::new();
    for line in output.lines() {
        let Some(first) = line.split_whitespace().next() else {
            continue;
        };
        if let Ok(addr) = first.parse::<IpAddr>() {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
    }
    addrs
}

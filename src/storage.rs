//! Storage service access
//!
//! [`StorageClient`] is the seam to the distributed storage service. [`EosCli`] implements
//! it by driving the `eos` command-line client in monitoring mode, where every output
//! line is a sequence of `key=value` tokens.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::models::QuotaRecord;

/// Raw metadata of one listed directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub uid: u64,
    pub attrs: HashMap<String, String>,
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Direct children of `prefix` on `host`.
    async fn list(&self, host: &str, prefix: &str) -> Result<Vec<FileInfo>>;

    /// Per-account quota of every user quota node covering `prefix`.
    async fn dump_quotas(&self, host: &str, prefix: &str) -> Result<HashMap<String, QuotaRecord>>;

    async fn mkdir(&self, host: &str, dir: &str) -> Result<()>;

    async fn upload(&self, host: &str, local: &Path, remote: &str) -> Result<()>;
}

pub struct EosCli {
    binary: String,
    list_timeout: Duration,
    quota_timeout: Duration,
    write_timeout: Duration,
}

impl EosCli {
    pub fn new(config: &StorageConfig, write_timeout_secs: u64) -> Self {
        Self {
            binary: config.eos_binary.clone(),
            list_timeout: Duration::from_secs(config.list_timeout_secs),
            quota_timeout: Duration::from_secs(config.quota_timeout_secs),
            write_timeout: Duration::from_secs(write_timeout_secs),
        }
    }

    async fn run(&self, host: &str, args: &[&str], deadline: Duration) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-b")
            .args(["-r", "0", "0"])
            .arg(host)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(host, ?args, "Running eos command");

        let output = tokio::time::timeout(deadline, cmd.output())
            .await
            .with_context(|| format!("eos {} timed out after {:?} on {}", args.join(" "), deadline, host))?
            .with_context(|| format!("Failed to start {}", self.binary))?;

        if !output.status.success() {
            anyhow::bail!(
                "eos {} failed on {} ({}): {}",
                args.join(" "),
                host,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl StorageClient for EosCli {
    async fn list(&self, host: &str, prefix: &str) -> Result<Vec<FileInfo>> {
        let raw = self
            .run(
                host,
                &["find", "--fileinfo", "--maxdepth", "1", prefix],
                self.list_timeout,
            )
            .await?;
        Ok(parse_listing(&raw, prefix))
    }

    async fn dump_quotas(&self, host: &str, prefix: &str) -> Result<HashMap<String, QuotaRecord>> {
        let raw = self
            .run(host, &["quota", "ls", "-m", prefix], self.quota_timeout)
            .await?;
        Ok(parse_quota_dump(&raw, prefix))
    }

    async fn mkdir(&self, host: &str, dir: &str) -> Result<()> {
        self.run(host, &["mkdir", "-p", dir], self.write_timeout)
            .await
            .map(|_| ())
    }

    async fn upload(&self, host: &str, local: &Path, remote: &str) -> Result<()> {
        let local = local.to_string_lossy();
        self.run(host, &["cp", local.as_ref(), remote], self.write_timeout)
            .await
            .map(|_| ())
    }
}

/// Split one monitoring-format line into its `key=value` pairs.
///
/// `keylength.file=N` announces that the following `file=` value is exactly N bytes
/// long, which is how paths containing spaces are transported.
pub fn parse_monitoring_line(line: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut rest = line.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().to_string();

        let value_len = if key == "file" {
            fields
                .get("keylength.file")
                .and_then(|v: &String| v.parse::<usize>().ok())
                .filter(|len| *len <= after.len() && after.is_char_boundary(*len))
        } else {
            None
        };

        let (value, remainder) = match value_len {
            Some(len) => (&after[..len], &after[len..]),
            None => match after.find(' ') {
                Some(pos) => (&after[..pos], &after[pos..]),
                None => (after, ""),
            },
        };

        fields.insert(key, value.to_string());
        rest = remainder.trim_start();
    }

    fields
}

fn parse_listing(raw: &str, prefix: &str) -> Vec<FileInfo> {
    let prefix = prefix.trim_end_matches('/');
    let mut infos = Vec::new();

    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let mut fields = parse_monitoring_line(line);
        let Some(path) = fields.remove("file") else {
            warn!(line, "Skipping listing line without file field");
            continue;
        };

        // find includes the searched directory itself
        if path.trim_end_matches('/') == prefix {
            continue;
        }

        let uid = match fields.get("uid").map(|v| v.parse::<u64>()) {
            Some(Ok(uid)) => uid,
            _ => {
                warn!(path = %path, "Skipping listing entry without numeric uid");
                continue;
            }
        };

        infos.push(FileInfo {
            path,
            uid,
            attrs: fields,
        });
    }

    infos
}

fn parse_quota_dump(raw: &str, prefix: &str) -> HashMap<String, QuotaRecord> {
    let mut quotas = HashMap::new();

    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let fields = parse_monitoring_line(line);

        let Some(space) = fields.get("space") else {
            continue;
        };
        let space = space.trim_end_matches('/');
        if space.is_empty() || !prefix.starts_with(space) {
            continue;
        }

        // group quota nodes carry gid= instead of uid=
        let Some(account) = fields.get("uid") else {
            continue;
        };

        let parse = |key: &str| fields.get(key).and_then(|v| v.parse::<i64>().ok());
        match (parse("maxlogicalbytes"), parse("usedlogicalbytes")) {
            (Some(max), Some(used)) => {
                quotas.insert(account.clone(), QuotaRecord::new(max, used));
            }
            _ => warn!(account = %account, "Skipping quota line with malformed byte counters"),
        }
    }

    quotas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_monitoring_line() {
        let fields = parse_monitoring_line("uid=1234 gid=100 ctime=1570000000.123 mode=40755");
        assert_eq!(fields["uid"], "1234");
        assert_eq!(fields["ctime"], "1570000000.123");
        assert_eq!(fields["mode"], "40755");
    }

    #[test]
    fn test_parse_monitoring_line_with_spaces_in_path() {
        let line = "keylength.file=23 file=/eos/project/a/my proj/ uid=7 ctime=1.0";
        let fields = parse_monitoring_line(line);
        assert_eq!(fields["file"], "/eos/project/a/my proj/");
        assert_eq!(fields["uid"], "7");
    }

    #[test]
    fn test_parse_listing_skips_prefix_and_bad_lines() {
        let raw = "\
keylength.file=15 file=/eos/project/a/ uid=0 ctime=1.0
keylength.file=21 file=/eos/project/a/atlas/ uid=1001 ctime=1570000000.5
keylength.file=19 file=/eos/project/a/cms/ uid=nope ctime=1.0
";
        let infos = parse_listing(raw, "/eos/project/a");
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].path, "/eos/project/a/atlas/");
        assert_eq!(infos[0].uid, 1001);
        assert_eq!(infos[0].attrs["ctime"], "1570000000.5");
    }

    #[test]
    fn test_parse_quota_dump() {
        let raw = "\
quota=node uid=alice space=/eos/user/ usedbytes=20 usedlogicalbytes=10 maxlogicalbytes=100 maxbytes=200
quota=node gid=it space=/eos/user/ usedlogicalbytes=5 maxlogicalbytes=50
quota=node uid=bob space=/eos/scratch/ usedlogicalbytes=1 maxlogicalbytes=2
quota=node uid=carol space=/eos/user/ usedlogicalbytes=x maxlogicalbytes=2
";
        let quotas = parse_quota_dump(raw, "/eos/user/");
        assert_eq!(quotas.len(), 1);
        assert_eq!(quotas["alice"], QuotaRecord::new(100, 10));
    }
}

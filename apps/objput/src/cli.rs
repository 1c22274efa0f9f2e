//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Upload a local file to an object store bucket.
///
/// Files larger than the threshold are uploaded in parts. Credentials are
/// read from OBJPUT_ACCESS_KEY_ID and OBJPUT_ACCESS_KEY_SECRET (or
/// ACCESS_KEY and ACCESS_SECRET).
#[derive(Debug, Default, Parser)]
#[command(name = "objput", version)]
pub struct Cli {
    /// Store endpoint, e.g. oss-cn-hangzhou.aliyuncs.com or http://localhost:9000.
    #[arg(long, env = "OBJPUT_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Destination bucket.
    #[arg(long, env = "OBJPUT_BUCKET")]
    pub bucket: Option<String>,

    /// Destination object key.
    #[arg(long)]
    pub object: Option<String>,

    /// Local file to upload.
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Signing region.
    #[arg(long, env = "OBJPUT_REGION")]
    pub region: Option<String>,

    /// Address buckets by path instead of by virtual host.
    #[arg(long)]
    pub path_style: bool,

    /// Size of each part, e.g. 64MiB (default 1GiB).
    #[arg(long, value_parser = parse_size)]
    pub part_size: Option<u64>,

    /// Largest file sent in a single request, e.g. 1GiB (default 1GiB).
    #[arg(long, value_parser = parse_size)]
    pub threshold: Option<u64>,

    /// Parts uploaded at once (default 1).
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Retries after a transient failure (default 3).
    #[arg(long)]
    pub retries: Option<u32>,

    /// Leave the multipart session on the store when an upload fails.
    #[arg(long)]
    pub keep_abandoned: bool,

    /// TOML configuration file.
    #[arg(long, env = "OBJPUT_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Parses a byte size such as `1048576`, `64MiB`, `512K` or `1GB`.
///
/// Unit prefixes are binary: `K`, `KB` and `KiB` all mean 1024 bytes.
pub fn parse_size(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    if digits.is_empty() {
        return Err(format!("invalid size {value:?}"));
    }
    let number: u64 = digits
        .parse()
        .map_err(|e| format!("invalid size {value:?}: {e}"))?;

    let shift = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        other => return Err(format!("unknown size unit {other:?}")),
    };
    number
        .checked_mul(1 << shift)
        .ok_or_else(|| format!("size {value:?} is too large"))
}

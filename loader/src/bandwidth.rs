//! Converts rclone style bandwidth limits and wraps commands with trickle

use regex::Regex;
use std::process::Command;
use std::sync::LazyLock;

use datasets::Error;

/// Matches a number with an optional unit suffix
static LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)?)([BKMGTP]?)$").unwrap());

/// Convert an rclone style bandwidth limit to KB/s for trickle
///
/// Plain numbers are KiB/s, the suffixes B|K|M|G|T|P are supported. Trickle
/// wants kilobytes of 1000 bytes so a positive limit never rounds below 1.
///
/// # Arguments
///
/// * `limit` - The raw bandwidth limit to convert
pub fn convert_to_kbps(limit: &str) -> Result<i64, Error> {
    if limit.is_empty() {
        return Ok(0);
    }
    // parse the number and suffix
    let upper = limit.to_uppercase();
    let captures = LIMIT_RE
        .captures(&upper)
        .ok_or_else(|| Error::new(format!("invalid bandwidth limit format: {limit}")))?;
    let number: f64 = captures[1]
        .parse()
        .map_err(|_| Error::new(format!("invalid number in bandwidth limit: {limit}")))?;
    // convert to bytes per second first
    let bytes_per_second = match &captures[2] {
        "B" => number,
        "" | "K" => number * 1024.0,
        "M" => number * 1024.0 * 1024.0,
        "G" => number * 1024.0 * 1024.0 * 1024.0,
        "T" => number * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "P" => number * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        suffix => return Err(Error::new(format!("unsupported suffix: {suffix}"))),
    };
    // trickle counts kilobytes of 1000 bytes
    let mut kbps = (bytes_per_second / 1000.0) as i64;
    if kbps == 0 && bytes_per_second > 0.0 {
        kbps = 1;
    }
    Ok(kbps)
}

/// Wrap a command with trickle so its network io is capped
///
/// The command is returned unchanged when no limit is set or the limit
/// converts to zero. The working directory and environment carry over.
///
/// # Arguments
///
/// * `cmd` - The command to wrap
/// * `limit` - The raw bandwidth limit to apply
pub fn wrap_command(cmd: Command, limit: &str) -> Result<Command, Error> {
    if limit.is_empty() {
        return Ok(cmd);
    }
    let kbps = convert_to_kbps(limit)
        .map_err(|error| Error::new(format!("failed to convert bandwidth limit: {}", error.msg())))?;
    if kbps <= 0 {
        return Ok(cmd);
    }
    // trickle -d <download_rate> -u <upload_rate> <original_command>
    let mut wrapped = Command::new("trickle");
    wrapped
        .arg("-d")
        .arg(kbps.to_string())
        .arg("-u")
        .arg(kbps.to_string())
        .arg(cmd.get_program());
    wrapped.args(cmd.get_args());
    if let Some(dir) = cmd.get_current_dir() {
        wrapped.current_dir(dir);
    }
    // carry over any explicit environment changes
    for (key, value) in cmd.get_envs() {
        match value {
            Some(value) => {
                wrapped.env(key, value);
            }
            None => {
                wrapped.env_remove(key);
            }
        }
    }
    Ok(wrapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn converts_supported_units() {
        let cases = [
            ("", 0),
            ("100", 102),
            ("1000B", 1),
            ("10K", 10),
            ("1M", 1048),
            ("1G", 1_073_741),
            ("1.5M", 1572),
            ("10m", 10485),
        ];
        for (input, expected) in cases {
            assert_eq!(convert_to_kbps(input).unwrap(), expected, "input {input}");
        }
    }

    #[test]
    fn rejects_invalid_limits() {
        for input in ["invalid", "-10M", "10X", "M10"] {
            assert!(convert_to_kbps(input).is_err(), "input {input}");
        }
    }

    #[test]
    fn clamps_tiny_positive_limits_to_one() {
        assert_eq!(convert_to_kbps("1B").unwrap(), 1);
        assert_eq!(convert_to_kbps("500B").unwrap(), 1);
    }

    #[test]
    fn wrap_preserves_command_without_limit() {
        let mut cmd = Command::new("git");
        cmd.args(["clone", "https://example.com/repo.git"]);
        let wrapped = wrap_command(cmd, "").unwrap();
        assert_eq!(wrapped.get_program(), OsStr::new("git"));
    }

    #[test]
    fn wrap_preserves_command_with_zero_limit() {
        let mut cmd = Command::new("git");
        cmd.args(["clone", "https://example.com/repo.git"]);
        let wrapped = wrap_command(cmd, "0").unwrap();
        assert_eq!(wrapped.get_program(), OsStr::new("git"));
    }

    #[test]
    fn wrap_rewrites_command_with_limit() {
        let mut cmd = Command::new("git");
        cmd.args(["clone", "https://example.com/repo.git"]);
        cmd.current_dir("/tmp");
        cmd.env("TEST", "1");
        let wrapped = wrap_command(cmd, "10M").unwrap();
        assert_eq!(wrapped.get_program(), OsStr::new("trickle"));
        let args: Vec<&OsStr> = wrapped.get_args().collect();
        assert_eq!(
            args,
            [
                "-d",
                "10485",
                "-u",
                "10485",
                "git",
                "clone",
                "https://example.com/repo.git"
            ]
            .map(OsStr::new)
        );
        assert_eq!(wrapped.get_current_dir(), Some(std::path::Path::new("/tmp")));
        let envs: Vec<_> = wrapped.get_envs().collect();
        assert!(envs.contains(&(OsStr::new("TEST"), Some(OsStr::new("1")))));
    }

    #[test]
    fn wrap_rejects_invalid_limit() {
        let cmd = Command::new("git");
        let error = wrap_command(cmd, "invalid").unwrap_err();
        assert!(error.msg().contains("failed to convert bandwidth limit"));
    }
}

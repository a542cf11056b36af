//! Kernel command line, read once at startup.
//!
//! Tokens are whitespace separated; double quotes group whitespace into one
//! token and are removed. Keys are compared with `-` and `_` treated alike.
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

const INIT_FLAGS_KEY: &str = "uroot.initflags";
const UINIT_ARGS_KEY: &str = "uroot.uinitargs";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmdline {
    raw: String,
    flags: HashMap<String, String>,
}

fn canonical_key(key: &str) -> String {
    key.replace('-', "_")
}

/// Splits `input` into `key -> value` pairs. A bare key maps to an empty value.
fn parse_to_map(input: &str) -> HashMap<String, String> {
    split_args(input)
        .into_iter()
        .map(|token| match token.split_once('=') {
            Some((key, value)) => (canonical_key(key), value.to_string()),
            None => (canonical_key(&token), String::new()),
        })
        .collect()
}

/// Quote-aware split into argv-style tokens.
pub fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;

    for c in input.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        args.push(current);
    }

    args
}

impl Cmdline {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read kernel command line {:?}", path))?;
        Ok(Self::parse(&raw))
    }

    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim().to_string();
        let flags = parse_to_map(&raw);
        Cmdline { raw, flags }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn contains_flag(&self, key: &str) -> bool {
        self.flags.contains_key(&canonical_key(key))
    }

    pub fn flag(&self, key: &str) -> Option<&str> {
        self.flags.get(&canonical_key(key)).map(String::as_str)
    }

    /// Flags passed to init inside `uroot.initflags="k=v ..."`.
    pub fn init_flags(&self) -> HashMap<String, String> {
        self.flag(INIT_FLAGS_KEY)
            .map(parse_to_map)
            .unwrap_or_default()
    }

    /// Extra argv for uinit from `uroot.uinitargs`.
    pub fn uinit_args(&self) -> Vec<String> {
        self.flag(UINIT_ARGS_KEY).map(split_args).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"console=ttyS0 earlyprintk=ttyS0 uroot.nohwrng uroot.uinitargs="-v --foo=bar" uroot.initflags="systemd=1 rootfs-netboot=true rootfs_netboot_init_path=/lib/systemd/systemd" root-fs=/dev/vda1
"#;

    #[test]
    fn test_split_args() {
        assert_eq!(split_args("  a b\t c\n"), vec!["a", "b", "c"]);
        assert_eq!(split_args(r#"a="b c" d"#), vec!["a=b c", "d"]);
        assert_eq!(split_args(r#""" x"#), vec!["", "x"]);
        assert!(split_args("   ").is_empty());
    }

    #[test]
    fn test_flags() {
        let cmdline = Cmdline::parse(SAMPLE);
        assert!(cmdline.contains_flag("uroot.nohwrng"));
        assert!(!cmdline.contains_flag("quiet"));
        assert_eq!(cmdline.flag("console"), Some("ttyS0"));
        assert_eq!(cmdline.flag("uroot.nohwrng"), Some(""));
        assert_eq!(cmdline.flag("root_fs"), Some("/dev/vda1"));
        assert_eq!(cmdline.flag("root-fs"), Some("/dev/vda1"));
        assert!(!cmdline.raw().ends_with('\n'));
    }

    #[test]
    fn test_init_flags() {
        let flags = Cmdline::parse(SAMPLE).init_flags();
        assert_eq!(flags.get("systemd").map(String::as_str), Some("1"));
        assert_eq!(flags.get("rootfs_netboot").map(String::as_str), Some("true"));
        assert_eq!(
            flags.get("rootfs_netboot_init_path").map(String::as_str),
            Some("/lib/systemd/systemd")
        );
        assert!(Cmdline::parse("quiet").init_flags().is_empty());
    }

    #[test]
    fn test_uinit_args() {
        assert_eq!(
            Cmdline::parse(SAMPLE).uinit_args(),
            vec!["-v", "--foo=bar"]
        );
        assert!(Cmdline::parse("").uinit_args().is_empty());
    }

    #[test]
    fn test_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cmdline");
        fs::write(&path, "uroot.nohwrng\n")?;
        assert!(Cmdline::read(&path)?.contains_flag("uroot.nohwrng"));
        assert!(Cmdline::read(dir.path().join("missing")).is_err());
        Ok(())
    }

    quickcheck! {
        fn property_test_split_args_on_plain_words(words: Vec<String>) -> bool {
            let words: Vec<String> = words
                .into_iter()
                .map(|w| w.chars().filter(|c| c.is_ascii_alphanumeric()).collect::<String>())
                .filter(|w| !w.is_empty())
                .collect();
            split_args(&words.join(" ")) == words
        }
    }
}

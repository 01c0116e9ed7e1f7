//! Command-line flags.

use std::path::PathBuf;

use clap::builder::NonEmptyStringValueParser;
use clap::Parser;

/// Assemble a container image and push it to a registry.
///
/// Starts from `--base` (or an empty image), applies the config overrides,
/// appends one layer built from `--data`, and writes the result to `--dest`.
#[derive(Parser, Debug)]
#[command(name = "strata", version, about)]
pub struct Cli {
    /// Environment variable (KEY=VALUE), can be repeated or comma-separated
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_arg)]
    pub env: Vec<EnvPairs>,

    /// User to run as
    #[arg(long)]
    pub user: Option<String>,

    /// Entrypoint of the image
    #[arg(long, value_name = "PATH")]
    pub entrypoint: Option<String>,

    /// Base image reference; an empty image when omitted
    #[arg(long, value_name = "REF", value_parser = NonEmptyStringValueParser::new())]
    pub base: Option<String>,

    /// Destination image reference
    #[arg(long, value_name = "REF", value_parser = NonEmptyStringValueParser::new())]
    pub dest: String,

    /// Tarball or directory to add as the top layer
    #[arg(long, value_name = "PATH", value_parser = NonEmptyStringValueParser::new())]
    pub data: String,

    /// Talk plain HTTP to registries
    #[arg(long)]
    pub insecure: bool,

    /// Recompress the data layer on every read instead of caching it
    #[arg(long)]
    pub no_cache: bool,
}

impl Cli {
    /// Path of the data layer source.
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data)
    }

    /// `--env` pairs with duplicate keys collapsed.
    ///
    /// A later value replaces an earlier one; the key keeps its first
    /// position.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let pairs: Vec<(String, String)> = self.env.iter().flat_map(|p| p.0.clone()).collect();
        merge_env(&pairs)
    }
}

/// The KEY=VALUE pairs of one `--env` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPairs(pub Vec<(String, String)>);

/// Parse one `--env` value.
///
/// A value with a single `=` is one pair, so commas inside it are kept
/// (`JAVA_OPTS=-Xms1g,-Xmx2g`). A value with several `=` is read as a CSV
/// record whose fields are each KEY=VALUE (`A=1,B=2`); quote a field to
/// keep a comma in it (`"A=1,2",B=3`).
fn parse_env_arg(arg: &str) -> Result<EnvPairs, String> {
    let fields = match arg.matches('=').count() {
        0 => {
            return Err(format!(
                "Invalid environment variable (expected KEY=VALUE): {arg}"
            ))
        }
        1 => vec![arg.trim_matches('"').to_string()],
        _ => split_csv_record(arg)?,
    };
    fields
        .iter()
        .map(|field| parse_env_var(field))
        .collect::<Result<Vec<_>, _>>()
        .map(EnvPairs)
}

/// Parse a KEY=VALUE pair.
fn parse_env_var(var: &str) -> Result<(String, String), String> {
    let (key, value) = var
        .split_once('=')
        .ok_or_else(|| format!("Invalid environment variable (expected KEY=VALUE): {var}"))?;
    if key.is_empty() {
        return Err(format!("Invalid environment variable (empty key): {var}"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Split one CSV record on commas.
///
/// A field wrapped in double quotes may contain commas and `""` for a
/// literal quote; a quote anywhere else is an error.
fn split_csv_record(record: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut chars = record.chars().peekable();
    loop {
        let mut field = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        field.push('"');
                    }
                    Some('"') => break,
                    Some(c) => field.push(c),
                    None => return Err(format!("Unterminated quote in --env value: {record}")),
                }
            }
            if !matches!(chars.peek(), None | Some(',')) {
                return Err(format!(
                    "Unexpected text after quoted field in --env value: {record}"
                ));
            }
        } else {
            while let Some(&c) = chars.peek() {
                match c {
                    ',' => break,
                    '"' => return Err(format!("Bare quote in --env value: {record}")),
                    c => field.push(c),
                }
                chars.next();
            }
        }
        fields.push(field);
        if chars.next().is_none() {
            return Ok(fields);
        }
    }
}

fn merge_env(vars: &[(String, String)]) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::with_capacity(vars.len());
    for (key, value) in vars {
        match merged.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.clone(),
            None => merged.push((key.clone(), value.clone())),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("strata").chain(args.iter().copied()))
    }

    fn pair(k: &str, v: &str) -> (String, String) {
        (k.to_string(), v.to_string())
    }

    fn env_of(args: &[&str]) -> Result<Vec<(String, String)>, clap::Error> {
        let mut all = Vec::new();
        for arg in args {
            all.extend(["--env", *arg]);
        }
        all.extend(["--dest", "app", "--data", "x"]);
        parse(&all).map(|cli| cli.env_vars())
    }

    #[test]
    fn test_minimal_flags() {
        let cli = parse(&["--dest", "ghcr.io/org/app:v1", "--data", "layer.tar"]).unwrap();
        assert_eq!(cli.dest, "ghcr.io/org/app:v1");
        assert_eq!(cli.data_path(), PathBuf::from("layer.tar"));
        assert!(cli.base.is_none());
        assert!(cli.user.is_none());
        assert!(cli.entrypoint.is_none());
        assert!(cli.env.is_empty());
        assert!(!cli.insecure);
        assert!(!cli.no_cache);
    }

    #[test]
    fn test_all_flags() {
        let cli = parse(&[
            "--env",
            "A=1",
            "--user",
            "app",
            "--entrypoint",
            "/bin/app",
            "--base",
            "alpine:3.19",
            "--dest",
            "localhost:5000/app",
            "--data",
            "./rootfs",
            "--insecure",
            "--no-cache",
        ])
        .unwrap();
        assert_eq!(cli.env_vars(), vec![pair("A", "1")]);
        assert_eq!(cli.user.as_deref(), Some("app"));
        assert_eq!(cli.entrypoint.as_deref(), Some("/bin/app"));
        assert_eq!(cli.base.as_deref(), Some("alpine:3.19"));
        assert!(cli.insecure);
        assert!(cli.no_cache);
    }

    #[test]
    fn test_missing_dest() {
        let err = parse(&["--data", "layer.tar"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert!(err.to_string().contains("--dest"));
    }

    #[test]
    fn test_missing_data() {
        let err = parse(&["--dest", "app:v1"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert!(err.to_string().contains("--data"));
    }

    #[test]
    fn test_empty_values_rejected() {
        assert!(parse(&["--dest", "", "--data", "layer.tar"]).is_err());
        assert!(parse(&["--dest", "app", "--data", ""]).is_err());
        assert!(parse(&["--dest", "app", "--data", "x", "--base", ""]).is_err());
    }

    #[test]
    fn test_env_repeated_and_comma_separated() {
        let env = env_of(&["A=1,B=2", "C=x=y"]).unwrap();
        assert_eq!(env, vec![pair("A", "1"), pair("B", "2"), pair("C", "x=y")]);
    }

    #[test]
    fn test_env_single_pair_keeps_commas() {
        let env = env_of(&["JAVA_OPTS=-Xms1g,-Xmx2g"]).unwrap();
        assert_eq!(env, vec![pair("JAVA_OPTS", "-Xms1g,-Xmx2g")]);
    }

    #[test]
    fn test_env_single_pair_trims_quotes() {
        let env = env_of(&["\"GREETING=hello, world\""]).unwrap();
        assert_eq!(env, vec![pair("GREETING", "hello, world")]);
    }

    #[test]
    fn test_env_quoted_csv_fields() {
        let env = env_of(&["\"A=1,2\",B=3"]).unwrap();
        assert_eq!(env, vec![pair("A", "1,2"), pair("B", "3")]);
    }

    #[test]
    fn test_env_empty_value_allowed() {
        assert_eq!(env_of(&["EMPTY="]).unwrap(), vec![pair("EMPTY", "")]);
    }

    #[test]
    fn test_env_invalid() {
        assert!(env_of(&["NOEQUALS"]).is_err());
        assert!(env_of(&["=value"]).is_err());
        // several pairs, one field without '='
        assert!(env_of(&["A=1,B=x,y"]).is_err());
        assert!(env_of(&["A=1,\"B=2"]).is_err());
    }

    #[test]
    fn test_split_csv_record() {
        assert_eq!(split_csv_record("a,b").unwrap(), vec!["a", "b"]);
        assert_eq!(split_csv_record("a,,b").unwrap(), vec!["a", "", "b"]);
        assert_eq!(
            split_csv_record("\"say \"\"hi\"\"\",x").unwrap(),
            vec!["say \"hi\"", "x"]
        );
        assert!(split_csv_record("a\"b,c").is_err());
        assert!(split_csv_record("\"a\"b,c").is_err());
    }

    #[test]
    fn test_merge_env_later_wins_first_position() {
        let merged = merge_env(&[pair("A", "1"), pair("B", "2"), pair("A", "3")]);
        assert_eq!(merged, vec![pair("A", "3"), pair("B", "2")]);
    }
}

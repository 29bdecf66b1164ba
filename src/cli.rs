use std::{env, path::PathBuf};

use anyhow::{Result, anyhow};

const USAGE: &str = "usage: custodian [--config <path>] [--resource-types <path>]... \
<validate <policy-file>... | schema [resource]>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Validate { files: Vec<PathBuf> },
    Schema { resource: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub config: Option<PathBuf>,
    pub resource_types: Vec<PathBuf>,
    pub command: Command,
}

pub fn invocation_from_args() -> Result<Invocation> {
    parse_args(env::args().skip(1))
}

pub fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Invocation> {
    let mut args = args.into_iter();
    let mut config = None;
    let mut resource_types = Vec::new();
    let mut positional = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow!("--config expects a path. {USAGE}"))?;
                config = Some(PathBuf::from(path));
            }
            "--resource-types" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow!("--resource-types expects a path. {USAGE}"))?;
                resource_types.push(PathBuf::from(path));
            }
            flag if flag.starts_with("--") => {
                return Err(anyhow!("unknown flag '{flag}'. {USAGE}"));
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("validate") => {
            let files: Vec<PathBuf> = positional.map(PathBuf::from).collect();
            if files.is_empty() {
                return Err(anyhow!("validate expects at least one policy file. {USAGE}"));
            }
            Command::Validate { files }
        }
        Some("schema") => {
            let resource = positional.next();
            if positional.next().is_some() {
                return Err(anyhow!("schema accepts at most one resource type. {USAGE}"));
            }
            Command::Schema { resource }
        }
        Some(other) => return Err(anyhow!("unknown command '{other}'. {USAGE}")),
        None => return Err(anyhow!("missing command. {USAGE}")),
    };

    Ok(Invocation {
        config,
        resource_types,
        command,
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{Command, parse_args};

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn validate_collects_files_and_flags() {
        let invocation = parse_args(args(&[
            "--config",
            "custodian.jsonc",
            "validate",
            "a.yml",
            "--resource-types",
            "types.json",
            "b.yml",
        ]))
        .expect("arguments should parse");
        assert_eq!(invocation.config, Some(PathBuf::from("custodian.jsonc")));
        assert_eq!(invocation.resource_types, vec![PathBuf::from("types.json")]);
        assert_eq!(
            invocation.command,
            Command::Validate {
                files: vec![PathBuf::from("a.yml"), PathBuf::from("b.yml")]
            }
        );
    }

    #[test]
    fn schema_resource_is_optional() {
        let invocation = parse_args(args(&["schema"])).expect("bare schema should parse");
        assert_eq!(invocation.command, Command::Schema { resource: None });
        assert!(parse_args(args(&["schema", "aws.ec2", "aws.s3"])).is_err());
    }

    #[test]
    fn missing_or_unknown_commands_fail() {
        assert!(parse_args(args(&[])).is_err());
        assert!(parse_args(args(&["run"])).is_err());
        assert!(parse_args(args(&["validate"])).is_err());
        assert!(parse_args(args(&["--verbose", "schema"])).is_err());
    }
}

use std::{path::Path, process::ExitCode, sync::Arc};

use anyhow::Context;
use custodian::{
    cli::{Command, Invocation, invocation_from_args},
    config::RuntimeConfig,
    logging::init_tracing,
    policy::{PolicyCollection, parse_document},
    provider::DescriptorProvider,
    resources::cache::build_cache,
    runtime::Core,
};

fn main() -> anyhow::Result<ExitCode> {
    let invocation = invocation_from_args()?;
    let config = match &invocation.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    let _logging = init_tracing(&config.logging)?;
    let core = build_core(&invocation, &config)?;

    match &invocation.command {
        Command::Validate { files } => Ok(validate(&core, files)),
        Command::Schema { resource } => {
            let schema = core.schema(resource.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_core(invocation: &Invocation, config: &RuntimeConfig) -> anyhow::Result<Arc<Core>> {
    let mut builder = Core::builder()?
        .options(config.core_options())
        .cache(build_cache(&config.cache));
    for path in &invocation.resource_types {
        let providers = DescriptorProvider::load_file(path)
            .with_context(|| format!("failed to load resource types from {}", path.display()))?;
        for provider in providers {
            builder = builder.provider(Arc::new(provider))?;
        }
    }
    Ok(builder.build()?)
}

fn validate(core: &Arc<Core>, files: &[impl AsRef<Path>]) -> ExitCode {
    let mut failed = false;
    for file in files {
        let file = file.as_ref();
        let errors = validate_file(core, file);
        if errors.is_empty() {
            println!("valid: {}", file.display());
            continue;
        }
        failed = true;
        for err in errors {
            eprintln!("invalid: {}: {err}", file.display());
        }
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn validate_file(core: &Arc<Core>, file: &Path) -> Vec<String> {
    let text = match std::fs::read_to_string(file) {
        Ok(text) => text,
        Err(err) => return vec![format!("failed to read: {err}")],
    };
    let document = match parse_document(&text) {
        Ok(document) => document,
        Err(err) => return vec![err.to_string()],
    };
    let errors = core.validate_document(&document);
    if !errors.is_empty() {
        return errors.iter().map(ToString::to_string).collect();
    }
    match PolicyCollection::from_document(&document, core) {
        Ok(collection) => {
            tracing::info!(
                target: "policy",
                file = %file.display(),
                policies = collection.len(),
                "policy_file_validated"
            );
            Vec::new()
        }
        Err(err) => vec![err.to_string()],
    }
}

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{CustodianError, Result, configuration_error, unknown_plugin};

#[derive(Debug, Clone)]
pub struct PluginEntry<T> {
    pub name: String,
    pub schema: Value,
    pub plugin: T,
}

/// Named plugin table keyed by type-tag.
#[derive(Debug, Clone)]
pub struct Registry<T> {
    kind: &'static str,
    entries: BTreeMap<String, PluginEntry<T>>,
    aliases: BTreeMap<String, String>,
}

impl<T> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn register(&mut self, name: &str, schema: Value, plugin: T) -> Result<()> {
        validate_plugin_name(self.kind, name)?;
        if self.contains(name) {
            return Err(configuration_error(format!(
                "{} type '{}' is already registered",
                self.kind, name
            )));
        }
        self.insert(name, schema, plugin);
        Ok(())
    }

    /// Registers `name`, replacing any existing entry. Returns the replaced plugin.
    pub fn register_override(&mut self, name: &str, schema: Value, plugin: T) -> Result<Option<T>> {
        validate_plugin_name(self.kind, name)?;
        self.aliases.remove(name);
        Ok(self.insert(name, schema, plugin).map(|entry| entry.plugin))
    }

    pub fn register_alias(&mut self, alias: &str, target: &str) -> Result<()> {
        validate_plugin_name(self.kind, alias)?;
        if self.contains(alias) {
            return Err(configuration_error(format!(
                "{} type '{}' is already registered",
                self.kind, alias
            )));
        }
        if !self.entries.contains_key(target) {
            return Err(configuration_error(format!(
                "cannot alias {} '{}' to unknown type '{}'",
                self.kind, alias, target
            )));
        }
        self.aliases.insert(alias.to_string(), target.to_string());
        Ok(())
    }

    fn insert(&mut self, name: &str, schema: Value, plugin: T) -> Option<PluginEntry<T>> {
        self.entries.insert(
            name.to_string(),
            PluginEntry {
                name: name.to_string(),
                schema,
                plugin,
            },
        )
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name) || self.aliases.contains_key(name)
    }

    pub fn find(&self, name: &str) -> Option<&PluginEntry<T>> {
        let resolved = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        self.entries.get(resolved)
    }

    pub fn get(&self, name: &str) -> Result<&PluginEntry<T>> {
        self.find(name).ok_or_else(|| self.unknown(name))
    }

    pub fn unknown(&self, name: &str) -> CustodianError {
        let keys = self.keys();
        unknown_plugin(self.kind, name, &keys)
    }

    /// All registered names, including aliases, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .entries
            .keys()
            .chain(self.aliases.keys())
            .map(String::as_str)
            .collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Schema fragments keyed by registered name. Aliases get a copy of their target's
    /// fragment with the `type` discriminator rewritten.
    pub fn schemas(&self) -> BTreeMap<String, Value> {
        let mut schemas: BTreeMap<String, Value> = self
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.schema.clone()))
            .collect();
        for (alias, target) in &self.aliases {
            if let Some(entry) = self.entries.get(target) {
                schemas.insert(alias.clone(), retag_schema(&entry.schema, alias));
            }
        }
        schemas
    }

    pub fn schema_for(&self, name: &str) -> Option<Value> {
        if let Some(target) = self.aliases.get(name) {
            return self
                .entries
                .get(target)
                .map(|entry| retag_schema(&entry.schema, name));
        }
        self.entries.get(name).map(|entry| entry.schema.clone())
    }
}

impl<T: Clone> Registry<T> {
    /// Copies every entry of `parent` that is not already present.
    pub fn inherit(&mut self, parent: &Registry<T>) {
        for (name, entry) in &parent.entries {
            if !self.contains(name) {
                self.entries.insert(name.clone(), entry.clone());
            }
        }
        for (alias, target) in &parent.aliases {
            if !self.contains(alias) {
                self.aliases.insert(alias.clone(), target.clone());
            }
        }
    }
}

fn retag_schema(schema: &Value, name: &str) -> Value {
    let mut schema = schema.clone();
    if let Some(type_prop) = schema
        .pointer_mut("/properties/type")
        .and_then(Value::as_object_mut)
    {
        type_prop.insert("enum".to_string(), Value::Array(vec![Value::from(name)]));
    }
    schema
}

fn validate_plugin_name(kind: &str, name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '.');
    let valid_edges = !name.starts_with(['-', '.']) && !name.ends_with(['-', '.']);
    if name.is_empty() || !valid_chars || !valid_edges {
        return Err(configuration_error(format!(
            "invalid {kind} name '{name}': names are lowercase and hyphen-separated"
        )));
    }
    Ok(())
}
